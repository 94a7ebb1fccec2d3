use std::cell::RefCell;
use std::rc::Rc;

use crate::node::{NodeId, NodePort};
use crate::rational::{ClockRational, DisplayTime};
use crate::state::BitVecState;

use super::TimingPhase;

/// Observer interface for everything a simulation run announces: time
/// progression, clock and reset edges, state commits, process IO, and
/// signal-tap diagnostics. All hooks default to no-ops; waveform recorders
/// and test fixtures implement the subset they care about.
pub trait SimulatorCallbacks {
    fn on_annotation_start(&mut self, _time: ClockRational, _id: &str, _desc: &str) {}
    fn on_annotation_end(&mut self, _time: ClockRational, _id: &str) {}

    fn on_power_on(&mut self) {}
    fn on_after_power_on(&mut self) {}
    fn on_commit_state(&mut self) {}
    fn on_new_tick(&mut self, _time: ClockRational) {}
    fn on_new_phase(&mut self, _phase: TimingPhase) {}
    fn on_after_micro_tick(&mut self, _micro_tick: usize) {}
    fn on_clock(&mut self, _clock: crate::clock::ClockId, _rising: bool) {}
    fn on_reset(&mut self, _clock: crate::clock::ClockId, _asserted: bool) {}

    fn on_debug_message(&mut self, _src: NodeId, _msg: &str) {}
    fn on_warning(&mut self, _src: NodeId, _msg: &str) {}
    fn on_assert(&mut self, _src: NodeId, _msg: &str) {}

    fn on_sim_proc_output_overridden(&mut self, _output: NodePort, _state: &BitVecState) {}
    fn on_sim_proc_output_read(&mut self, _output: NodePort, _state: &BitVecState) {}
}

/// Fans callbacks out to every registered listener. Listeners are shared
/// so callers can keep a handle and inspect what was recorded after a run.
#[derive(Default)]
pub struct CallbackDispatcher {
    listeners: Vec<Rc<RefCell<dyn SimulatorCallbacks>>>,
}

impl CallbackDispatcher {
    pub fn push(&mut self, listener: Rc<RefCell<dyn SimulatorCallbacks>>) {
        self.listeners.push(listener);
    }
}

macro_rules! dispatch {
    ($name:ident ( $($arg:ident : $ty:ty),* )) => {
        fn $name(&mut self, $($arg: $ty),*) {
            for listener in &self.listeners {
                listener.borrow_mut().$name($($arg),*);
            }
        }
    };
}

impl SimulatorCallbacks for CallbackDispatcher {
    dispatch!(on_annotation_start(time: ClockRational, id: &str, desc: &str));
    dispatch!(on_annotation_end(time: ClockRational, id: &str));
    dispatch!(on_power_on());
    dispatch!(on_after_power_on());
    dispatch!(on_commit_state());
    dispatch!(on_new_tick(time: ClockRational));
    dispatch!(on_new_phase(phase: TimingPhase));
    dispatch!(on_after_micro_tick(micro_tick: usize));
    dispatch!(on_clock(clock: crate::clock::ClockId, rising: bool));
    dispatch!(on_reset(clock: crate::clock::ClockId, asserted: bool));
    dispatch!(on_debug_message(src: NodeId, msg: &str));
    dispatch!(on_warning(src: NodeId, msg: &str));
    dispatch!(on_assert(src: NodeId, msg: &str));
    dispatch!(on_sim_proc_output_overridden(output: NodePort, state: &BitVecState));
    dispatch!(on_sim_proc_output_read(output: NodePort, state: &BitVecState));
}

/// Prints diagnostics as `[time] severity@node: message`.
pub struct SimulatorConsoleOutput {
    time: ClockRational,
}

impl Default for SimulatorConsoleOutput {
    fn default() -> Self {
        Self { time: ClockRational::from_integer(0) }
    }
}

impl SimulatorCallbacks for SimulatorConsoleOutput {
    fn on_new_tick(&mut self, time: ClockRational) {
        self.time = time;
    }

    fn on_debug_message(&mut self, src: NodeId, msg: &str) {
        println!("[{}] debug@{}: {}", DisplayTime(self.time), src, msg);
    }

    fn on_warning(&mut self, src: NodeId, msg: &str) {
        println!("[{}] warning@{}: {}", DisplayTime(self.time), src, msg);
    }

    fn on_assert(&mut self, src: NodeId, msg: &str) {
        println!("[{}] assert@{}: {}", DisplayTime(self.time), src, msg);
    }
}
