use std::cell::RefCell;
use std::rc::Rc;

use crate::circuit::Circuit;
use crate::clock::ClockId;
use crate::errors::Result;
use crate::node::{NodeId, NodePort};
use crate::rational::rational;
use crate::state::BitVecState;

use super::{ReferenceSimulator, SimulatorCallbacks};

#[derive(Default)]
struct DiagnosticsRecorder {
    warnings: Vec<String>,
    asserts: Vec<String>,
    debug_messages: Vec<String>,
}

impl SimulatorCallbacks for DiagnosticsRecorder {
    fn on_debug_message(&mut self, src: NodeId, msg: &str) {
        self.debug_messages.push(format!("{}: {}", src, msg));
    }

    fn on_warning(&mut self, src: NodeId, msg: &str) {
        self.warnings.push(format!("{}: {}", src, msg));
    }

    fn on_assert(&mut self, src: NodeId, msg: &str) {
        self.asserts.push(format!("{}: {}", src, msg));
    }
}

/// Test harness around the reference simulator: compiles a circuit,
/// records every warning and assert of the run, and fails the test on
/// drop if any were seen.
pub struct SimFixture {
    sim: ReferenceSimulator,
    recorder: Rc<RefCell<DiagnosticsRecorder>>,
    checked: bool,
}

impl SimFixture {
    pub fn compile(circuit: Circuit) -> Result<Self> {
        let mut sim = ReferenceSimulator::compile(circuit, &[])?;
        let recorder = Rc::new(RefCell::new(DiagnosticsRecorder::default()));
        sim.add_callbacks(recorder.clone());
        Ok(Self { sim, recorder, checked: false })
    }

    pub fn sim(&mut self) -> &mut ReferenceSimulator {
        &mut self.sim
    }

    /// Powers on and settles combinational logic once; for circuits
    /// without clocks.
    pub fn eval(&mut self) {
        self.sim.power_on();
        self.sim.reevaluate();
        self.sim.commit_state();
    }

    /// Powers on and runs the given number of full periods of `clock`.
    pub fn run_ticks(&mut self, clock: ClockId, ticks: u64) {
        self.sim.power_on();
        let period = rational(1, 1) / self.period_freq(clock);
        self.sim.advance(period * ticks);
    }

    fn period_freq(&self, clock: ClockId) -> crate::rational::ClockRational {
        self.sim.program().circuit.clock_absolute_frequency(clock)
    }

    pub fn value(&mut self, output: NodePort) -> BitVecState {
        self.sim.value_of_output(output)
    }

    pub fn value_u64(&mut self, output: NodePort) -> Option<u64> {
        self.sim.value_of_output_u64(output)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.recorder.borrow().warnings.clone()
    }

    pub fn asserts(&self) -> Vec<String> {
        self.recorder.borrow().asserts.clone()
    }

    pub fn debug_messages(&self) -> Vec<String> {
        self.recorder.borrow().debug_messages.clone()
    }

    /// Fails the test when warnings or asserts were recorded. Called
    /// implicitly on drop; call explicitly for a better panic location.
    pub fn expect_clean(mut self) {
        self.checked = true;
        let recorder = self.recorder.borrow();
        assert!(
            recorder.warnings.is_empty(),
            "simulation warnings: {:?}",
            recorder.warnings
        );
        assert!(
            recorder.asserts.is_empty(),
            "simulation asserts: {:?}",
            recorder.asserts
        );
    }
}

impl Drop for SimFixture {
    fn drop(&mut self) {
        if self.checked || std::thread::panicking() {
            return;
        }
        let recorder = self.recorder.borrow();
        assert!(
            recorder.warnings.is_empty(),
            "simulation warnings: {:?}",
            recorder.warnings
        );
        assert!(
            recorder.asserts.is_empty(),
            "simulation asserts: {:?}",
            recorder.asserts
        );
    }
}
