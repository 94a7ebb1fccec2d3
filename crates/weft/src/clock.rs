use std::fmt;

use crate::HashMap;
use crate::circuit::Circuit;
use crate::rational::ClockRational;
use crate::subnet::Subnet;

/// Index into the circuit's clock arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockId(pub usize);

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clk{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Rising,
    Falling,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    None,
    Synchronous,
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetActive {
    High,
    Low,
}

/// Per-clock register semantics the exporter and simulator agree on.
#[derive(Debug, Clone, Copy)]
pub struct RegisterAttributes {
    pub reset_kind: ResetKind,
    pub reset_active: ResetActive,
    /// Power registers up undefined instead of with their reset value.
    pub initialize_undefined: bool,
}

impl Default for RegisterAttributes {
    fn default() -> Self {
        Self {
            reset_kind: ResetKind::Synchronous,
            reset_active: ResetActive::High,
            initialize_undefined: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClockKind {
    Root {
        frequency: ClockRational,
    },
    Derived {
        parent: ClockId,
        multiplier: ClockRational,
    },
}

/// A logical clock. Clocks form their own tree: a root clock carries an
/// absolute frequency, derived clocks a rational multiplier relative to
/// their parent. Several logical clocks may share one physical pin.
#[derive(Debug, Clone)]
pub struct Clock {
    pub id: ClockId,
    pub kind: ClockKind,
    pub name: String,
    pub reset_name: String,
    pub trigger_event: TriggerEvent,
    pub phase_synchronous_with_parent: bool,
    pub min_reset_time: ClockRational,
    pub min_reset_cycles: usize,
    pub attributes: RegisterAttributes,
}

impl Clock {
    pub fn new_root(id: ClockId, name: impl Into<String>, frequency: ClockRational) -> Self {
        Self {
            id,
            kind: ClockKind::Root { frequency },
            name: name.into(),
            reset_name: String::new(),
            trigger_event: TriggerEvent::Rising,
            phase_synchronous_with_parent: true,
            min_reset_time: ClockRational::from_integer(0),
            min_reset_cycles: 0,
            attributes: RegisterAttributes::default(),
        }
    }

    pub fn new_derived(id: ClockId, parent: &Clock, multiplier: ClockRational) -> Self {
        Self {
            id,
            kind: ClockKind::Derived { parent: parent.id, multiplier },
            name: parent.name.clone(),
            reset_name: parent.reset_name.clone(),
            trigger_event: parent.trigger_event,
            phase_synchronous_with_parent: true,
            min_reset_time: ClockRational::from_integer(0),
            min_reset_cycles: 0,
            attributes: parent.attributes,
        }
    }

    pub fn parent(&self) -> Option<ClockId> {
        match self.kind {
            ClockKind::Root { .. } => None,
            ClockKind::Derived { parent, .. } => Some(parent),
        }
    }

    /// Minimum hold merges by maximum so shared reset pins satisfy every
    /// clock hanging off them.
    pub fn raise_min_reset_time(&mut self, time: ClockRational) {
        self.min_reset_time = self.min_reset_time.max(time);
    }

    pub fn raise_min_reset_cycles(&mut self, cycles: usize) {
        self.min_reset_cycles = self.min_reset_cycles.max(cycles);
    }
}

impl Circuit {
    pub fn clock_absolute_frequency(&self, id: ClockId) -> ClockRational {
        match self.clock(id).kind {
            ClockKind::Root { frequency } => frequency,
            ClockKind::Derived { parent, multiplier } => {
                self.clock_absolute_frequency(parent) * multiplier
            }
        }
    }

    pub fn clock_frequency_relative_to(&self, id: ClockId, other: ClockId) -> ClockRational {
        self.clock_absolute_frequency(id) / self.clock_absolute_frequency(other)
    }

    /// The clock in the tree that provides the physical clock signal for
    /// `id`. Derived clocks that keep frequency, name, and phase of their
    /// parent share the parent's pin.
    pub fn clock_pin_source(&self, id: ClockId) -> ClockId {
        let clock = self.clock(id);
        if let ClockKind::Derived { parent, multiplier } = clock.kind {
            if multiplier == ClockRational::from_integer(1)
                && clock.phase_synchronous_with_parent
                && clock.name == self.clock(parent).name
            {
                return self.clock_pin_source(parent);
            }
        }
        id
    }

    /// The clock that provides the physical reset for `id`, or none if the
    /// clock has no reset.
    pub fn reset_pin_source(&self, id: ClockId) -> Option<ClockId> {
        let clock = self.clock(id);
        if clock.attributes.reset_kind == ResetKind::None {
            return None;
        }
        if let ClockKind::Derived { parent, .. } = clock.kind {
            if clock.reset_name == self.clock(parent).reset_name
                && self.clock(parent).attributes.reset_kind != ResetKind::None
            {
                return self.reset_pin_source(parent);
            }
        }
        Some(id)
    }
}

/// One physical clock pin and the logical clocks sharing it.
#[derive(Debug, Clone)]
pub struct ClockPin {
    pub source: ClockId,
    pub clocks: Vec<ClockId>,
}

/// One physical reset pin; hold requirements are the maximum over sharers.
#[derive(Debug, Clone)]
pub struct ResetPin {
    pub source: ClockId,
    pub clocks: Vec<ClockId>,
    pub min_reset_time: ClockRational,
    pub min_reset_cycles: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ClockPinAllocation {
    pub clock_pins: Vec<ClockPin>,
    pub reset_pins: Vec<ResetPin>,
    pub clock_to_pin: HashMap<ClockId, usize>,
    pub clock_to_reset_pin: HashMap<ClockId, usize>,
}

impl ClockPinAllocation {
    /// The longest reset hold of a reset pin, in seconds, for a given
    /// source clock frequency.
    pub fn reset_hold_time(&self, circuit: &Circuit, pin: usize) -> ClockRational {
        let reset = &self.reset_pins[pin];
        let freq = circuit.clock_absolute_frequency(reset.source);
        let by_cycles = ClockRational::from_integer(reset.min_reset_cycles as u64) / freq;
        reset.min_reset_time.max(by_cycles)
    }
}

/// Determines which clocks drive nodes of the subnet, directly or through
/// derived clocks, and deduplicates them onto physical pins.
pub fn allocate_clock_pins(circuit: &Circuit, subnet: &Subnet) -> ClockPinAllocation {
    // A clock is relevant if it clocks a subnet node or any derived clock is.
    let mut drives: Vec<bool> = vec![false; circuit.clock_count()];
    for node in circuit.nodes() {
        if !subnet.contains(node.id) {
            continue;
        }
        for clock in node.clocks.iter().flatten() {
            drives[clock.0] = true;
        }
    }

    let mut children: Vec<Vec<ClockId>> = vec![Vec::new(); circuit.clock_count()];
    for clock in circuit.clocks() {
        if let Some(parent) = clock.parent() {
            children[parent.0].push(clock.id);
        }
    }

    fn relevant(id: ClockId, drives: &[bool], children: &[Vec<ClockId>]) -> bool {
        drives[id.0] || children[id.0].iter().any(|c| relevant(*c, drives, children))
    }

    let mut res = ClockPinAllocation::default();
    for clock in circuit.clocks() {
        if !relevant(clock.id, &drives, &children) {
            continue;
        }

        let pin_source = circuit.clock_pin_source(clock.id);
        let pin_idx = match res.clock_to_pin.get(&pin_source) {
            Some(&idx) => idx,
            None => {
                let idx = res.clock_pins.len();
                res.clock_pins.push(ClockPin { source: pin_source, clocks: Vec::new() });
                res.clock_to_pin.insert(pin_source, idx);
                idx
            }
        };
        res.clock_pins[pin_idx].clocks.push(clock.id);
        res.clock_to_pin.insert(clock.id, pin_idx);

        if let Some(reset_source) = circuit.reset_pin_source(clock.id) {
            let reset_idx = match res.clock_to_reset_pin.get(&reset_source) {
                Some(&idx) => idx,
                None => {
                    let idx = res.reset_pins.len();
                    res.reset_pins.push(ResetPin {
                        source: reset_source,
                        clocks: Vec::new(),
                        min_reset_time: ClockRational::from_integer(0),
                        min_reset_cycles: 0,
                    });
                    res.clock_to_reset_pin.insert(reset_source, idx);
                    idx
                }
            };
            let reset = &mut res.reset_pins[reset_idx];
            reset.clocks.push(clock.id);
            reset.min_reset_time = reset.min_reset_time.max(circuit.clock(clock.id).min_reset_time);
            reset.min_reset_cycles = reset.min_reset_cycles.max(circuit.clock(clock.id).min_reset_cycles);
            res.clock_to_reset_pin.insert(clock.id, reset_idx);
        }
    }
    res
}
