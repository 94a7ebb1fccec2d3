use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::clock::ClockId;
use crate::node::{NodeId, NodePort};
use crate::rational::ClockRational;
use crate::state::{BitVecState, Plane};

use super::{Notification, SimShared, SpawnRequest, TimingPhase};

/// A simulation process: a plain future driven by the simulator's event
/// loop. It may only suspend through the wait primitives on [`SimHandle`].
pub type SimProcess = Pin<Box<dyn Future<Output = ()>>>;

/// Outputs a process wants to be woken for.
#[derive(Debug, Clone, Default)]
pub struct SensitivityList {
    pub outputs: Vec<NodePort>,
}

impl SensitivityList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, output: NodePort) -> Self {
        self.outputs.push(output);
        self
    }
}

/// What a suspended process is waiting for; deposited by the wait futures
/// and consumed by the scheduler after each `Pending` poll.
pub enum WaitRequest {
    For(ClockRational),
    Until(ClockRational),
    Clock { clock: ClockId, phase: TimingPhase },
    Change(SensitivityList),
    Stable,
    Join(Rc<JoinInner>),
}

#[derive(Default)]
pub struct JoinInner {
    pub(super) done: Cell<bool>,
}

/// Await to resume after the forked process has finished.
pub struct JoinHandle {
    pub(super) inner: Rc<JoinInner>,
    pub(super) proc_state: Rc<RefCell<ProcState>>,
}

impl Future for JoinHandle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.done.get() {
            Poll::Ready(())
        } else {
            self.proc_state.borrow_mut().wait_request =
                Some(WaitRequest::Join(self.inner.clone()));
            Poll::Pending
        }
    }
}

/// Per-process slot the wait futures communicate through.
#[derive(Default)]
pub struct ProcState {
    pub(super) wait_request: Option<WaitRequest>,
}

/// Suspends once, delivering its request to the scheduler, and completes
/// on the second poll.
pub struct WaitFuture {
    proc_state: Rc<RefCell<ProcState>>,
    request: Option<WaitRequest>,
}

impl Future for WaitFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match this.request.take() {
            Some(request) => {
                this.proc_state.borrow_mut().wait_request = Some(request);
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

/// A process's access to the running simulation: sampling outputs, driving
/// pins, forking, and the five suspension points. Reads and writes are
/// synchronous; only the `wait_*` futures suspend.
#[derive(Clone)]
pub struct SimHandle {
    pub(super) shared: Rc<RefCell<SimShared>>,
    pub(super) proc_state: Rc<RefCell<ProcState>>,
}

impl SimHandle {
    fn wait(&self, request: WaitRequest) -> WaitFuture {
        WaitFuture { proc_state: self.proc_state.clone(), request: Some(request) }
    }

    /// Suspends for a duration of simulation time.
    pub fn wait_for(&self, duration: ClockRational) -> WaitFuture {
        self.wait(WaitRequest::For(duration))
    }

    /// Suspends until an absolute simulation time.
    pub fn wait_until(&self, time: ClockRational) -> WaitFuture {
        self.wait(WaitRequest::Until(time))
    }

    /// Suspends until the clock's next triggering edge, resuming in the
    /// requested phase of that edge.
    pub fn wait_clock(&self, clock: ClockId, phase: TimingPhase) -> WaitFuture {
        self.wait(WaitRequest::Clock { clock, phase })
    }

    /// Suspends until any of the listed outputs changes value.
    pub fn wait_change(&self, sensitivity: SensitivityList) -> WaitFuture {
        self.wait(WaitRequest::Change(sensitivity))
    }

    /// Suspends until combinational logic has settled at the current time.
    pub fn wait_stable(&self) -> WaitFuture {
        self.wait(WaitRequest::Stable)
    }

    /// Spawns a child process; it starts at the scheduler's next
    /// opportunity. Await the returned handle to join it.
    pub fn fork<F, Fut>(&self, body: F) -> JoinHandle
    where
        F: FnOnce(SimHandle) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let child_state = Rc::new(RefCell::new(ProcState::default()));
        let child_handle = SimHandle {
            shared: self.shared.clone(),
            proc_state: child_state.clone(),
        };
        let join = Rc::new(JoinInner::default());
        let future: SimProcess = Box::pin(body(child_handle));
        self.shared.borrow_mut().pending_spawns.push(SpawnRequest {
            future,
            proc_state: child_state,
            join: Some(join.clone()),
        });
        JoinHandle { inner: join, proc_state: self.proc_state.clone() }
    }

    /// Samples an output port. Combinational logic is settled first if a
    /// previous write left it stale, so a process always reads the
    /// consequences of its own writes.
    pub fn sample(&self, output: NodePort) -> BitVecState {
        let mut shared = self.shared.borrow_mut();
        if shared.dirty {
            shared.reevaluate();
        }
        let value = shared.extract_output(output);
        shared.notifications.push(Notification::OutputRead(output, value.clone()));
        value
    }

    /// Samples an output as a `u64`; undefined bits read as `None`.
    pub fn sample_value(&self, output: NodePort) -> Option<u64> {
        let state = self.sample(output);
        if state.size() == 0 || state.size() > 64 || !state.all_defined(0, state.size()) {
            return None;
        }
        Some(state.extract(Plane::Value, 0, state.size()))
    }

    /// Drives an input pin. Takes effect immediately; dependent
    /// combinational logic re-evaluates lazily before the next read.
    pub fn set_pin(&self, pin: NodeId, value: &BitVecState) {
        let mut shared = self.shared.borrow_mut();
        shared.write_pin(pin, value);
        shared
            .notifications
            .push(Notification::OutputOverridden(NodePort::new(pin, 0), value.clone()));
    }

    /// Overrides a register's output until its next clock activation.
    pub fn override_register(&self, register: NodeId, value: &BitVecState) {
        let mut shared = self.shared.borrow_mut();
        shared.write_output(NodePort::new(register, 0), value);
        shared
            .notifications
            .push(Notification::OutputOverridden(NodePort::new(register, 0), value.clone()));
    }

    pub fn time(&self) -> ClockRational {
        self.shared.borrow().time
    }

    pub fn phase(&self) -> TimingPhase {
        self.shared.borrow().phase
    }

    pub fn micro_tick(&self) -> usize {
        self.shared.borrow().micro_tick
    }

    /// True while the simulator tears processes down (on abort or drop);
    /// cleanup code must not touch simulation state then.
    pub fn simulation_is_shutting_down(&self) -> bool {
        self.shared.borrow().shutting_down
    }
}
