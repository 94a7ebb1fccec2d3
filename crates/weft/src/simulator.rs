use std::cell::{Ref, RefCell};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use log::trace;

use crate::circuit::Circuit;
use crate::clock::{ClockId, ResetKind};
use crate::errors::Result;
use crate::node::{NodeId, NodePort};
use crate::rational::{rational, ClockRational};
use crate::state::{BitVecState, Plane};

pub mod callbacks;
pub mod fixture;
pub mod process;
pub mod program;
pub mod waveform;

pub use callbacks::{CallbackDispatcher, SimulatorCallbacks, SimulatorConsoleOutput};
pub use fixture::SimFixture;
pub use process::{JoinHandle, SensitivityList, SimHandle, SimProcess, WaitRequest};
pub use program::{ExecutionBlock, MappedNode, Program};
pub use waveform::VcdWriter;

use process::{JoinInner, ProcState};

/// Sub-phases of a clock event. Processes waiting `Before` sample the
/// pre-edge state, `During` runs the register advance, `After` exposes the
/// post-edge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimingPhase {
    Before,
    During,
    After,
}

/// The mutable half of a running simulation: the packed signal state plus
/// per-pin clock and reset levels.
#[derive(Debug, Default)]
pub struct DataState {
    pub signal: BitVecState,
    pub clock_high: Vec<bool>,
    pub reset_high: Vec<bool>,
}

pub(crate) enum Notification {
    OutputRead(NodePort, BitVecState),
    OutputOverridden(NodePort, BitVecState),
}

pub(crate) struct SpawnRequest {
    pub future: SimProcess,
    pub proc_state: Rc<RefCell<ProcState>>,
    pub join: Option<Rc<JoinInner>>,
}

/// Simulation state shared between the event loop and suspended processes.
/// The loop never holds a borrow across a process poll, so handle methods
/// can borrow freely.
pub(crate) struct SimShared {
    pub program: Program,
    pub state: DataState,
    pub dirty: bool,
    pub shutting_down: bool,
    pub time: ClockRational,
    pub phase: TimingPhase,
    pub micro_tick: usize,
    /// Per clock pin: the time of its next triggering edge.
    pub pin_next_trigger: Vec<ClockRational>,
    pub notifications: Vec<Notification>,
    pub pending_spawns: Vec<SpawnRequest>,
}

impl SimShared {
    pub(crate) fn reevaluate(&mut self) {
        let SimShared { program, state, .. } = self;
        for block in &program.execution_blocks {
            block.evaluate(&program.circuit, &mut state.signal);
        }
        self.dirty = false;
    }

    pub(crate) fn extract_output(&self, output: NodePort) -> BitVecState {
        match self.program.mapping.output_offset(output) {
            Some(offset) => {
                let width = self.program.output_width(output);
                self.state.signal.extract_state(offset, width)
            }
            None => BitVecState::new(0),
        }
    }

    pub(crate) fn write_pin(&mut self, pin: NodeId, value: &BitVecState) {
        let Some(internal) = self.program.mapping.node_internal.get(&pin) else { return };
        let offset = internal[0];
        let width = self.program.output_width(NodePort::new(pin, 0));
        self.state.signal.copy_range(offset, value, 0, width.min(value.size()));
        self.dirty = true;
    }

    pub(crate) fn write_output(&mut self, output: NodePort, value: &BitVecState) {
        let Some(offset) = self.program.mapping.output_offset(output) else { return };
        let width = self.program.output_width(output);
        self.state.signal.copy_range(offset, value, 0, width.min(value.size()));
        self.dirty = true;
    }
}

#[derive(Debug, Clone)]
enum EventKind {
    ResetChange { pin: usize, assert: bool },
    ClockEdge { pin: usize, rising: bool },
    ProcResume { proc: usize },
}

impl EventKind {
    fn rank(&self) -> u8 {
        match self {
            EventKind::ResetChange { .. } => 0,
            EventKind::ClockEdge { .. } => 1,
            EventKind::ProcResume { .. } => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct Event {
    time: ClockRational,
    phase: TimingPhase,
    micro_tick: usize,
    insertion: u64,
    kind: EventKind,
}

impl Event {
    fn key(&self) -> (ClockRational, TimingPhase, usize, u8, u64) {
        (self.time, self.phase, self.micro_tick, self.kind.rank(), self.insertion)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

struct ProcSlot {
    future: SimProcess,
    state: Rc<RefCell<ProcState>>,
    join: Option<Rc<JoinInner>>,
}

struct SignalWatch {
    proc: usize,
    entries: Vec<(usize, usize)>,
    snapshot: BitVecState,
}

impl SignalWatch {
    fn capture(entries: Vec<(usize, usize)>, state: &BitVecState) -> BitVecState {
        let total: usize = entries.iter().map(|(_, w)| w).sum();
        let mut snapshot = BitVecState::new(total);
        let mut at = 0;
        for (offset, width) in &entries {
            snapshot.copy_range(at, state, *offset, *width);
            at += width;
        }
        snapshot
    }

    fn changed(&self, state: &BitVecState) -> bool {
        let mut at = 0;
        for (offset, width) in &self.entries {
            if !self.snapshot.range_equal(at, state, *offset, *width) {
                return true;
            }
            at += width;
        }
        false
    }
}

/// Per-visualization opaque state plus its hooks. Not required for
/// correctness; captured on power-on and every committed tick.
pub struct SimVisualization {
    pub state: Box<dyn std::any::Any>,
    pub on_reset: Box<dyn FnMut(&mut dyn std::any::Any)>,
    pub on_capture: Box<dyn FnMut(&mut dyn std::any::Any, &Program, &BitVecState)>,
    pub on_render: Box<dyn FnMut(&dyn std::any::Any)>,
}

type ProcFactory = Box<dyn Fn(SimHandle) -> SimProcess>;

/// Event-driven, cycle-accurate interpreter of a compiled circuit. Owns
/// the circuit for the duration of the run; single-threaded with
/// cooperatively scheduled simulation processes.
pub struct ReferenceSimulator {
    shared: Rc<RefCell<SimShared>>,
    callbacks: CallbackDispatcher,
    queue: BinaryHeap<Reverse<Event>>,
    procs: Vec<Option<ProcSlot>>,
    proc_factories: Vec<ProcFactory>,
    watches: Vec<SignalWatch>,
    pending_joins: Vec<(Rc<JoinInner>, usize)>,
    visualizations: Vec<SimVisualization>,
    next_insertion: u64,
    abort_called: bool,
    current_step_finished: bool,
}

impl std::fmt::Debug for ReferenceSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceSimulator").finish_non_exhaustive()
    }
}

impl ReferenceSimulator {
    /// Compiles the circuit (restricted to the cone of `outputs` when
    /// non-empty) and prepares an idle simulator; call
    /// [`ReferenceSimulator::power_on`] to start.
    pub fn compile(circuit: Circuit, outputs: &[NodePort]) -> Result<Self> {
        let program = Program::compile(circuit, outputs)?;
        let num_pins = program.pin_allocation.clock_pins.len();
        let num_resets = program.pin_allocation.reset_pins.len();
        let shared = SimShared {
            program,
            state: DataState {
                signal: BitVecState::new(0),
                clock_high: vec![false; num_pins],
                reset_high: vec![false; num_resets],
            },
            dirty: false,
            shutting_down: false,
            time: rational(0, 1),
            phase: TimingPhase::During,
            micro_tick: 0,
            pin_next_trigger: vec![rational(0, 1); num_pins],
            notifications: Vec::new(),
            pending_spawns: Vec::new(),
        };
        Ok(Self {
            shared: Rc::new(RefCell::new(shared)),
            callbacks: CallbackDispatcher::default(),
            queue: BinaryHeap::new(),
            procs: Vec::new(),
            proc_factories: Vec::new(),
            watches: Vec::new(),
            pending_joins: Vec::new(),
            visualizations: Vec::new(),
            next_insertion: 0,
            abort_called: false,
            current_step_finished: false,
        })
    }

    pub fn add_callbacks(&mut self, listener: Rc<RefCell<dyn SimulatorCallbacks>>) {
        self.callbacks.push(listener);
    }

    /// Registers a simulation process; it starts at every power-on.
    pub fn add_simulation_process<F, Fut>(&mut self, factory: F)
    where
        F: Fn(SimHandle) -> Fut + 'static,
        Fut: std::future::Future<Output = ()> + 'static,
    {
        self.proc_factories
            .push(Box::new(move |handle| Box::pin(factory(handle)) as SimProcess));
    }

    pub fn add_visualization(&mut self, visualization: SimVisualization) {
        self.visualizations.push(visualization);
    }

    pub fn program(&self) -> Ref<'_, Program> {
        Ref::map(self.shared.borrow(), |s| &s.program)
    }

    pub fn current_time(&self) -> ClockRational {
        self.shared.borrow().time
    }

    pub fn current_phase(&self) -> TimingPhase {
        self.shared.borrow().phase
    }

    pub fn current_micro_tick(&self) -> usize {
        self.shared.borrow().micro_tick
    }

    pub fn abort_called(&self) -> bool {
        self.abort_called
    }

    /// Resets circuit state and processes into the power-on state: state
    /// all-undefined, power-on resets applied, clocks seeded half a period
    /// before their first edge, resets asserted, one settling evaluation,
    /// then every registered process started.
    pub fn power_on(&mut self) {
        self.queue.clear();
        self.procs.clear();
        self.watches.clear();
        self.pending_joins.clear();
        self.next_insertion = 0;
        self.abort_called = false;

        self.callbacks.on_power_on();

        {
            let mut sh = self.shared.borrow_mut();
            sh.shutting_down = false;
            sh.time = rational(0, 1);
            sh.micro_tick = 0;
            sh.phase = TimingPhase::During;
            sh.dirty = false;
            sh.notifications.clear();
            sh.pending_spawns.clear();
            let width = sh.program.state_width;
            sh.state.signal = BitVecState::new(width);
            for level in sh.state.clock_high.iter_mut() {
                *level = false;
            }
            for level in sh.state.reset_high.iter_mut() {
                *level = true;
            }

            let SimShared { program, state, .. } = &mut *sh;
            for mapped in &program.power_on_nodes {
                program.circuit.node(mapped.node).simulate_reset(
                    &program.circuit,
                    &mut state.signal,
                    &mapped.internal,
                    &mapped.outputs,
                );
            }
        }

        // Seed every clock pin: first (rising) edge half a period from zero.
        let num_pins = self.shared.borrow().program.pin_allocation.clock_pins.len();
        for pin in 0..num_pins {
            let (half, trigger) = {
                let sh = self.shared.borrow();
                let source = sh.program.pin_allocation.clock_pins[pin].source;
                let freq = sh.program.circuit.clock_absolute_frequency(source);
                (rational(1, 2) / freq, sh.program.circuit.clock(source).trigger_event)
            };
            {
                let mut sh = self.shared.borrow_mut();
                sh.pin_next_trigger[pin] = match trigger {
                    crate::clock::TriggerEvent::Rising | crate::clock::TriggerEvent::Both => half,
                    crate::clock::TriggerEvent::Falling => half + half,
                };
            }
            self.push_event(half, TimingPhase::During, 0, EventKind::ClockEdge { pin, rising: true });
        }

        // Resets assert at power-on and deassert after their minimum hold.
        let num_resets = self.shared.borrow().program.pin_allocation.reset_pins.len();
        for pin in 0..num_resets {
            let (source, hold) = {
                let sh = self.shared.borrow();
                let source = sh.program.pin_allocation.reset_pins[pin].source;
                let hold = sh.program.pin_allocation.reset_hold_time(&sh.program.circuit, pin);
                (source, hold)
            };
            self.callbacks.on_reset(source, true);
            if hold > rational(0, 1) {
                self.push_event(hold, TimingPhase::During, 0, EventKind::ResetChange { pin, assert: false });
            } else {
                self.shared.borrow_mut().state.reset_high[pin] = false;
                self.callbacks.on_reset(source, false);
            }
        }

        // Settle combinational logic so processes see defined state at t=0.
        self.shared.borrow_mut().reevaluate();

        for visualization in &mut self.visualizations {
            (visualization.on_reset)(&mut *visualization.state);
        }

        // Start every registered process up to its first suspension.
        let factories = std::mem::take(&mut self.proc_factories);
        for factory in &factories {
            let state = Rc::new(RefCell::new(ProcState::default()));
            let handle = SimHandle { shared: self.shared.clone(), proc_state: state.clone() };
            let future = factory(handle);
            let id = self.alloc_proc(ProcSlot { future, state, join: None });
            self.poll_proc(id);
        }
        self.proc_factories = factories;
        self.drain_shared();
        if self.shared.borrow().dirty {
            self.shared.borrow_mut().reevaluate();
        }

        self.callbacks.on_after_power_on();
        self.current_step_finished = true;
    }

    /// Forces a re-evaluation of all combinational logic.
    pub fn reevaluate(&mut self) {
        self.shared.borrow_mut().reevaluate();
    }

    /// Declares the current state final for this time step: runs commit
    /// handlers (signal taps fire here) and captures visualizations.
    pub fn commit_state(&mut self) {
        {
            let mut sh = self.shared.borrow_mut();
            let SimShared { program, state, .. } = &mut *sh;
            for block in &program.execution_blocks {
                block.commit(&program.circuit, &mut state.signal, &mut self.callbacks);
            }
            for visualization in &mut self.visualizations {
                (visualization.on_capture)(&mut *visualization.state, program, &state.signal);
            }
        }
        self.callbacks.on_commit_state();
    }

    pub fn render_visualizations(&mut self) {
        for visualization in &mut self.visualizations {
            (visualization.on_render)(&*visualization.state);
        }
    }

    /// Advances to the next event and processes everything scheduled at
    /// that instant, phase by phase, with micro-tick reconvergence after
    /// every batch of process resumes.
    pub fn advance_event(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        // Writes from outside the event loop (tests driving pins) must be
        // propagated into register latches before any edge advances.
        if self.shared.borrow().dirty {
            self.shared.borrow_mut().reevaluate();
        }
        if self.current_step_finished {
            self.commit_state();
            let next_time = self.queue.peek().expect("checked non-empty").0.time;
            {
                let mut sh = self.shared.borrow_mut();
                sh.time = next_time;
                sh.micro_tick = 0;
            }
            trace!("tick {}", crate::rational::DisplayTime(next_time));
            self.callbacks.on_new_tick(next_time);
            self.current_step_finished = false;
        }

        let now = self.shared.borrow().time;
        while let Some(Reverse(head)) = self.queue.peek() {
            if head.time != now {
                break;
            }
            let batch_phase = head.phase;
            let batch_micro = head.micro_tick;
            let phase_changed = {
                let mut sh = self.shared.borrow_mut();
                let changed = sh.phase != batch_phase;
                sh.phase = batch_phase;
                changed
            };
            if phase_changed {
                self.callbacks.on_new_phase(batch_phase);
            }

            let mut triggered_blocks: BTreeSet<usize> = BTreeSet::new();
            let mut resumes: Vec<usize> = Vec::new();
            while let Some(Reverse(head)) = self.queue.peek() {
                if head.time != now || head.phase != batch_phase || head.micro_tick != batch_micro {
                    break;
                }
                let Reverse(event) = self.queue.pop().expect("peeked");
                match event.kind {
                    EventKind::ResetChange { pin, assert } => {
                        self.handle_reset_change(pin, assert, &mut triggered_blocks);
                    }
                    EventKind::ClockEdge { pin, rising } => {
                        self.handle_clock_edge(now, pin, rising, &mut triggered_blocks);
                    }
                    EventKind::ProcResume { proc } => resumes.push(proc),
                }
            }

            if !triggered_blocks.is_empty() {
                let mut sh = self.shared.borrow_mut();
                let SimShared { program, state, .. } = &mut *sh;
                for idx in &triggered_blocks {
                    program.execution_blocks[*idx].evaluate(&program.circuit, &mut state.signal);
                }
            }

            for proc in resumes {
                self.poll_proc(proc);
                if self.abort_called {
                    return;
                }
            }
            self.drain_shared();

            if self.shared.borrow().dirty {
                let micro_tick = {
                    let mut sh = self.shared.borrow_mut();
                    sh.reevaluate();
                    sh.micro_tick += 1;
                    sh.micro_tick
                };
                self.callbacks.on_after_micro_tick(micro_tick);
            }
            self.check_signal_watches(now);
        }

        self.current_step_finished = true;
    }

    /// Advances by the given amount of simulation time (or until aborted).
    pub fn advance(&mut self, duration: ClockRational) {
        let target = self.current_time() + duration;
        loop {
            let next = self.queue.peek().map(|Reverse(e)| e.time);
            match next {
                Some(t) if t <= target => {
                    self.advance_event();
                    if self.abort_called {
                        return;
                    }
                }
                _ => {
                    self.shared.borrow_mut().time = target;
                    return;
                }
            }
        }
    }

    /// Drops all scheduled events and tears down outstanding processes.
    /// Process cleanup observes `simulation_is_shutting_down() == true`.
    pub fn abort(&mut self) {
        self.abort_called = true;
        self.queue.clear();
        self.shared.borrow_mut().shutting_down = true;
        self.procs.clear();
        self.watches.clear();
        self.pending_joins.clear();
    }

    /// The value of an output port, settling combinational logic first if
    /// needed. Outputs optimized away yield an empty state.
    pub fn value_of_output(&mut self, output: NodePort) -> BitVecState {
        let mut sh = self.shared.borrow_mut();
        if sh.dirty {
            sh.reevaluate();
        }
        sh.extract_output(output)
    }

    /// Convenience for tests: an output's value as `u64`, `None` when any
    /// bit is undefined.
    pub fn value_of_output_u64(&mut self, output: NodePort) -> Option<u64> {
        let state = self.value_of_output(output);
        if state.size() == 0 || state.size() > 64 || !state.all_defined(0, state.size()) {
            return None;
        }
        Some(state.extract(Plane::Value, 0, state.size()))
    }

    pub fn output_optimized_away(&self, output: NodePort) -> bool {
        self.shared.borrow().program.mapping.output_offset(output).is_none()
    }

    /// A node's hidden state block (register contents, memory words).
    pub fn value_of_internal_state(&mut self, node: NodeId, idx: usize) -> BitVecState {
        let mut sh = self.shared.borrow_mut();
        if sh.dirty {
            sh.reevaluate();
        }
        let Some(internal) = sh.program.mapping.node_internal.get(&node) else {
            return BitVecState::new(0);
        };
        let offset = internal[idx];
        let width = sh.program.circuit.node(node).internal_state_sizes()[idx];
        sh.state.signal.extract_state(offset, width)
    }

    pub fn value_of_clock(&self, clock: ClockId) -> Option<bool> {
        let sh = self.shared.borrow();
        let source = sh.program.circuit.clock_pin_source(clock);
        let pin = *sh.program.pin_allocation.clock_to_pin.get(&source)?;
        Some(sh.state.clock_high[pin])
    }

    pub fn value_of_reset(&self, clock: ClockId) -> Option<bool> {
        let sh = self.shared.borrow();
        let source = sh.program.circuit.reset_pin_source(clock)?;
        let pin = *sh.program.pin_allocation.clock_to_reset_pin.get(&source)?;
        Some(sh.state.reset_high[pin])
    }

    /// Drives an input pin from outside a simulation process.
    pub fn set_input_pin(&mut self, pin: NodeId, value: &BitVecState) {
        let mut sh = self.shared.borrow_mut();
        sh.write_pin(pin, value);
    }

    pub fn annotation_start(&mut self, id: &str, desc: &str) {
        let time = self.current_time();
        self.callbacks.on_annotation_start(time, id, desc);
    }

    pub fn annotation_end(&mut self, id: &str) {
        let time = self.current_time();
        self.callbacks.on_annotation_end(time, id);
    }

    // --- internals -------------------------------------------------------

    fn push_event(&mut self, time: ClockRational, phase: TimingPhase, micro_tick: usize, kind: EventKind) {
        let insertion = self.next_insertion;
        self.next_insertion += 1;
        self.queue.push(Reverse(Event { time, phase, micro_tick, insertion, kind }));
    }

    fn alloc_proc(&mut self, slot: ProcSlot) -> usize {
        self.procs.push(Some(slot));
        self.procs.len() - 1
    }

    fn handle_clock_edge(
        &mut self,
        now: ClockRational,
        pin: usize,
        rising: bool,
        triggered: &mut BTreeSet<usize>,
    ) {
        let (source, half) = {
            let mut sh = self.shared.borrow_mut();
            sh.state.clock_high[pin] = rising;

            let SimShared { program, state, pin_next_trigger, .. } = &mut *sh;
            let source = program.pin_allocation.clock_pins[pin].source;
            let domain = &program.clock_domains[pin];
            for cn in &domain.clocked_nodes {
                let node = program.circuit.node(cn.mapped.node);
                node.simulate_clock_change(&mut state.signal, &cn.mapped.outputs, rising, true);

                let clock = program.circuit.clock(cn.clock);
                let triggers = match clock.trigger_event {
                    crate::clock::TriggerEvent::Both => true,
                    crate::clock::TriggerEvent::Rising => rising,
                    crate::clock::TriggerEvent::Falling => !rising,
                };
                if !triggers {
                    continue;
                }

                let reset_asserted = program
                    .pin_allocation
                    .clock_to_reset_pin
                    .get(&program.circuit.reset_pin_source(cn.clock).unwrap_or(cn.clock))
                    .map(|&r| state.reset_high[r])
                    .unwrap_or(false);
                if reset_asserted {
                    match clock.attributes.reset_kind {
                        ResetKind::Synchronous => node.simulate_reset_change(
                            &program.circuit,
                            &mut state.signal,
                            &cn.mapped.outputs,
                            true,
                        ),
                        // Held in reset; the value was loaded on assertion.
                        ResetKind::Asynchronous => {}
                        ResetKind::None => node.simulate_advance(
                            &program.circuit,
                            &mut state.signal,
                            &cn.mapped.internal,
                            &cn.mapped.outputs,
                            cn.clock_port,
                        ),
                    }
                } else {
                    node.simulate_advance(
                        &program.circuit,
                        &mut state.signal,
                        &cn.mapped.internal,
                        &cn.mapped.outputs,
                        cn.clock_port,
                    );
                }
            }
            // Clock-to-signal outputs change on every edge, so dependent
            // logic re-evaluates even when no register triggered.
            if !domain.clocked_nodes.is_empty() {
                triggered.extend(domain.dependent_blocks.iter().copied());
            }

            let freq = program.circuit.clock_absolute_frequency(source);
            let half = rational(1, 2) / freq;
            let next_edge_triggers = match program.circuit.clock(source).trigger_event {
                crate::clock::TriggerEvent::Both => true,
                crate::clock::TriggerEvent::Rising => !rising,
                crate::clock::TriggerEvent::Falling => rising,
            };
            pin_next_trigger[pin] = if next_edge_triggers { now + half } else { now + half + half };
            (source, half)
        };

        self.callbacks.on_clock(source, rising);
        self.push_event(now + half, TimingPhase::During, 0, EventKind::ClockEdge { pin, rising: !rising });
    }

    fn handle_reset_change(&mut self, pin: usize, assert: bool, triggered: &mut BTreeSet<usize>) {
        let source = {
            let mut sh = self.shared.borrow_mut();
            sh.state.reset_high[pin] = assert;

            let SimShared { program, state, .. } = &mut *sh;
            if assert {
                // Asynchronous resets take effect immediately.
                for domain in program.clock_domains.iter() {
                    for cn in &domain.clocked_nodes {
                        let reset_source = program.circuit.reset_pin_source(cn.clock);
                        let Some(reset_source) = reset_source else { continue };
                        if program.pin_allocation.clock_to_reset_pin.get(&reset_source) != Some(&pin) {
                            continue;
                        }
                        if program.circuit.clock(cn.clock).attributes.reset_kind
                            == ResetKind::Asynchronous
                        {
                            program.circuit.node(cn.mapped.node).simulate_reset_change(
                                &program.circuit,
                                &mut state.signal,
                                &cn.mapped.outputs,
                                true,
                            );
                            triggered.extend(domain.dependent_blocks.iter().copied());
                        }
                    }
                }
            }
            program.pin_allocation.reset_pins[pin].source
        };
        self.callbacks.on_reset(source, assert);
    }

    fn poll_proc(&mut self, id: usize) {
        let Some(slot) = self.procs.get_mut(id).and_then(|s| s.as_mut()) else { return };
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        let poll = slot.future.as_mut().poll(&mut cx);
        match poll {
            Poll::Ready(()) => {
                let slot = self.procs[id].take().expect("just polled");
                if let Some(join) = slot.join {
                    join.done.set(true);
                    self.resume_joiners(&join);
                }
            }
            Poll::Pending => {
                let request = slot.state.borrow_mut().wait_request.take();
                if let Some(request) = request {
                    self.schedule_wait(id, request);
                }
            }
        }
    }

    fn resume_joiners(&mut self, join: &Rc<JoinInner>) {
        let (now, phase, micro) = {
            let sh = self.shared.borrow();
            (sh.time, sh.phase, sh.micro_tick)
        };
        let mut waiting = Vec::new();
        self.pending_joins.retain(|(inner, proc)| {
            if Rc::ptr_eq(inner, join) {
                waiting.push(*proc);
                false
            } else {
                true
            }
        });
        for proc in waiting {
            self.push_event(now, phase, micro, EventKind::ProcResume { proc });
        }
    }

    fn schedule_wait(&mut self, proc: usize, request: WaitRequest) {
        let (now, phase, micro) = {
            let sh = self.shared.borrow();
            (sh.time, sh.phase, sh.micro_tick)
        };
        match request {
            WaitRequest::For(duration) => {
                if duration == rational(0, 1) {
                    self.push_event(now, phase, micro + 1, EventKind::ProcResume { proc });
                } else {
                    self.push_event(now + duration, TimingPhase::During, 0, EventKind::ProcResume { proc });
                }
            }
            WaitRequest::Until(time) => {
                let time = time.max(now);
                self.push_event(time, TimingPhase::During, 0, EventKind::ProcResume { proc });
            }
            WaitRequest::Clock { clock, phase: wanted } => {
                let sh = self.shared.borrow();
                let source = sh.program.circuit.clock_pin_source(clock);
                let Some(&pin) = sh.program.pin_allocation.clock_to_pin.get(&source) else {
                    drop(sh);
                    // Waiting on a clock outside the simulated subnet never
                    // resumes; treat it as waiting forever.
                    return;
                };
                let time = sh.pin_next_trigger[pin];
                drop(sh);
                self.push_event(time, wanted, 0, EventKind::ProcResume { proc });
            }
            WaitRequest::Change(sensitivity) => {
                let mut sh = self.shared.borrow_mut();
                if sh.dirty {
                    sh.reevaluate();
                }
                let sh = sh;
                let mut entries = Vec::new();
                for output in &sensitivity.outputs {
                    if let Some(offset) = sh.program.mapping.output_offset(*output) {
                        entries.push((offset, sh.program.output_width(*output)));
                    }
                }
                let snapshot = SignalWatch::capture(entries.clone(), &sh.state.signal);
                drop(sh);
                self.watches.push(SignalWatch { proc, entries, snapshot });
            }
            WaitRequest::Stable => {
                self.push_event(now, phase, micro + 1, EventKind::ProcResume { proc });
            }
            WaitRequest::Join(inner) => {
                if inner.done.get() {
                    self.push_event(now, phase, micro, EventKind::ProcResume { proc });
                } else {
                    self.pending_joins.push((inner, proc));
                }
            }
        }
    }

    fn drain_shared(&mut self) {
        loop {
            let (notifications, spawns) = {
                let mut sh = self.shared.borrow_mut();
                (
                    std::mem::take(&mut sh.notifications),
                    std::mem::take(&mut sh.pending_spawns),
                )
            };
            if notifications.is_empty() && spawns.is_empty() {
                return;
            }
            for notification in notifications {
                match notification {
                    Notification::OutputRead(output, state) => {
                        self.callbacks.on_sim_proc_output_read(output, &state);
                    }
                    Notification::OutputOverridden(output, state) => {
                        self.callbacks.on_sim_proc_output_overridden(output, &state);
                    }
                }
            }
            for spawn in spawns {
                let id = self.alloc_proc(ProcSlot {
                    future: spawn.future,
                    state: spawn.proc_state,
                    join: spawn.join,
                });
                self.poll_proc(id);
            }
        }
    }

    fn check_signal_watches(&mut self, now: ClockRational) {
        if self.watches.is_empty() {
            return;
        }
        let (phase, micro) = {
            let sh = self.shared.borrow();
            (sh.phase, sh.micro_tick)
        };
        let mut fired: Vec<usize> = Vec::new();
        {
            let sh = self.shared.borrow();
            for (idx, watch) in self.watches.iter().enumerate() {
                if watch.changed(&sh.state.signal) {
                    fired.push(idx);
                }
            }
        }
        for idx in fired.iter().rev() {
            let watch = self.watches.swap_remove(*idx);
            self.push_event(now, phase, micro, EventKind::ProcResume { proc: watch.proc });
        }
    }
}

impl Drop for ReferenceSimulator {
    fn drop(&mut self) {
        // Processes being torn down must see the shutdown flag.
        if let Ok(mut shared) = self.shared.try_borrow_mut() {
            shared.shutting_down = true;
        }
        self.procs.clear();
    }
}
