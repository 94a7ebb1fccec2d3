//! Weft builds digital circuits as typed dataflow graphs, canonicalizes
//! them through a pipeline of semantics-preserving rewrites, and executes
//! them in a cycle-accurate, event-driven reference simulator.
//!
//! The graph ([`Circuit`], [`node`]) is constructed through plain API
//! calls, optimized in place ([`optimizer::optimize`]), and either handed
//! to an exporter (via [`Subnet::all_for_export`] and clock pin
//! allocation) or compiled and run by the [`ReferenceSimulator`].

mod circuit;
mod clock;
mod conjunction;
mod errors;
mod explore;
mod group;
pub mod node;
pub mod optimizer;
mod rational;
pub mod simulator;
pub mod state;
mod subnet;

pub(crate) use fxhash::FxHashMap as HashMap;
pub(crate) use fxhash::FxHashSet as HashSet;

pub use circuit::Circuit;
pub use clock::{
    allocate_clock_pins, Clock, ClockId, ClockKind, ClockPin, ClockPinAllocation,
    RegisterAttributes, ResetActive, ResetKind, ResetPin, TriggerEvent,
};
pub use conjunction::Conjunction;
pub use errors::{DesignError, Result};
pub use explore::{ExploreHandle, Exploration};
pub use group::{GroupId, GroupType, MemoryGroupInfo, NodeGroup, ReadPortInfo};
pub use node::{
    ConnectionType, Node, NodeId, NodeKind, NodePort, OutputKind,
};
pub use rational::{rational, ClockRational, DisplayTime};
pub use simulator::{
    ReferenceSimulator, SensitivityList, SimFixture, SimHandle, SimulatorCallbacks,
    SimulatorConsoleOutput, TimingPhase, VcdWriter,
};
pub use state::{bit_state, undefined_state, value_state, BitVecState, Plane};
pub use subnet::Subnet;

#[cfg(test)]
mod sim_tests;
