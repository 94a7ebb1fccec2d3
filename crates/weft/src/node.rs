use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

use num_bigint::BigUint;
use num_traits::Zero;
use smallvec::SmallVec;

use crate::circuit::Circuit;
use crate::clock::ClockId;
use crate::group::GroupId;
use crate::simulator::SimulatorCallbacks;
use crate::state::{BitVecState, Plane, UNCONNECTED};

/// Stable node identity within one circuit. Ids are assigned monotonically
/// and never reused, so maps and sorted orders over them are reproducible
/// across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One endpoint of a connection: a node plus one of its port indices.
/// Used for both output ports (as a driver) and input ports (as a consumer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePort {
    pub node: NodeId,
    pub port: usize,
}

impl NodePort {
    pub fn new(node: NodeId, port: usize) -> Self {
        Self { node, port }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Bool,
    BitVec(usize),
    /// Zero-width ordering edge carrying no data.
    Dependency,
}

impl ConnectionType {
    pub fn width(self) -> usize {
        match self {
            ConnectionType::Bool => 1,
            ConnectionType::BitVec(w) => w,
            ConnectionType::Dependency => 0,
        }
    }

    pub fn is_dependency(self) -> bool {
        matches!(self, ConnectionType::Dependency)
    }

    /// Assignment compatibility: equality, except dependencies coerce.
    pub fn compatible(self, other: ConnectionType) -> bool {
        self == other || self.is_dependency() || other.is_dependency()
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Bool => write!(f, "bool"),
            ConnectionType::BitVec(w) => write!(f, "bitvec<{}>", w),
            ConnectionType::Dependency => write!(f, "dependency"),
        }
    }
}

/// How the simulator may treat an output between evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Pure function of the inputs, recomputed every evaluation.
    Immediate,
    /// State that survives unevaluated cycles (registers, memory reads, pins).
    Latched,
    Constant,
}

#[derive(Debug, Clone, Default)]
pub struct InputPort {
    pub driver: Option<NodePort>,
}

#[derive(Debug, Clone)]
pub struct OutputPort {
    pub ty: ConnectionType,
    pub kind: OutputKind,
    /// Input ports driven by this output. Maintained by the circuit on
    /// every connect, disconnect, and rewire.
    pub consumers: Vec<NodePort>,
}

impl OutputPort {
    fn new(ty: ConnectionType, kind: OutputKind) -> Self {
        Self { ty, kind, consumers: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicOp {
    And,
    Nand,
    Or,
    Nor,
    Xor,
    Xnor,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Gt,
    Leq,
    Geq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Input,
    Output,
    BiDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapLevel {
    Assert,
    Warn,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapTrigger {
    FirstInputHigh,
    FirstInputLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    DontCare,
    Bram,
    Lutram,
    External,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterFlags {
    pub allow_retiming_forward: bool,
    pub allow_retiming_backward: bool,
    pub bound_to_memory: bool,
}

/// Where one output range of a rewire node takes its bits from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSource {
    Input { index: usize, offset: usize },
    ConstZero,
    ConstOne,
    ConstUndefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewireRange {
    pub subwidth: usize,
    pub source: RangeSource,
}

/// Declarative bit shuffling: the output is the concatenation of the listed
/// ranges, each selecting from an input or a constant fill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewireOp {
    pub ranges: Vec<RewireRange>,
}

impl RewireOp {
    pub fn add_input(&mut self, index: usize, offset: usize, width: usize) -> &mut Self {
        if width > 0 {
            self.ranges.push(RewireRange {
                subwidth: width,
                source: RangeSource::Input { index, offset },
            });
        }
        self
    }

    pub fn add_constant(&mut self, source: RangeSource, width: usize) -> &mut Self {
        debug_assert!(!matches!(source, RangeSource::Input { .. }));
        if width > 0 {
            self.ranges.push(RewireRange { subwidth: width, source });
        }
        self
    }

    pub fn total_width(&self) -> usize {
        self.ranges.iter().map(|r| r.subwidth).sum()
    }

    /// A single one-bit range selecting from input 0 is a plain bit extract.
    pub fn is_bit_extract(&self) -> Option<usize> {
        match self.ranges.as_slice() {
            [RewireRange { subwidth: 1, source: RangeSource::Input { index: 0, offset } }] => {
                Some(*offset)
            }
            _ => None,
        }
    }

    /// Extract `count` bits starting at `offset` from input 0.
    pub fn extract(offset: usize, count: usize) -> Self {
        let mut op = Self::default();
        op.add_input(0, offset, count);
        op
    }

    /// Replace `width` bits of input 0 at `offset` with input 1.
    pub fn replace_range(total: usize, offset: usize, width: usize) -> Self {
        debug_assert!(total >= offset + width);
        let mut op = Self::default();
        op.add_input(0, 0, offset);
        op.add_input(1, 0, width);
        op.add_input(0, offset + width, total - offset - width);
        op
    }

    /// Zero- (or one-, or undefined-) pad input 0 from `from` to `to` bits.
    pub fn pad(from: usize, to: usize, padding: RangeSource) -> Self {
        let mut op = Self::default();
        op.add_input(0, 0, from.min(to));
        if to > from {
            op.add_constant(padding, to - from);
        }
        op
    }
}

pub const REG_DATA: usize = 0;
pub const REG_RESET_VALUE: usize = 1;
pub const REG_ENABLE: usize = 2;
pub const REG_INT_DATA: usize = 0;
pub const REG_INT_ENABLE: usize = 1;

pub const EXPORT_SIM: usize = 0;
pub const EXPORT_EXPORT: usize = 1;

pub const MEMPORT_MEMORY: usize = 0;
pub const MEMPORT_ADDRESS: usize = 1;
pub const MEMPORT_ENABLE: usize = 2;
pub const MEMPORT_WRDATA: usize = 3;
pub const MEMPORT_ORDER_AFTER: usize = 4;
pub const MEMPORT_RDDATA: usize = 0;
pub const MEMPORT_ORDER_BEFORE: usize = 1;
pub const MEMPORT_INT_ADDR: usize = 0;
pub const MEMPORT_INT_ENABLE: usize = 1;
pub const MEMPORT_INT_WRDATA: usize = 2;
pub const MEMPORT_INT_MEMORY: usize = 3;

const ADDR_STATE_BITS: usize = 64;

#[derive(Debug, Clone)]
pub struct MemoryDesc {
    /// Total content size in bits.
    pub size: usize,
    /// Width of one addressable word.
    pub word_width: usize,
    pub mem_type: MemType,
    /// Power-on content; missing words power on undefined.
    pub initial: Option<BitVecState>,
    /// Promise that no two ports ever collide on an address, disabling
    /// hazard logic generation.
    pub no_conflicts: bool,
}

impl MemoryDesc {
    pub fn word_count(&self) -> usize {
        if self.word_width == 0 { 0 } else { self.size / self.word_width }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemPortDesc {
    pub word_width: usize,
    pub reads: bool,
    pub writes: bool,
}

/// The closed set of node kinds with their per-kind payloads. Behavior
/// differences are match arms on this tag.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Constant { value: BitVecState, ty: ConnectionType },
    Signal,
    Rewire { num_inputs: usize, op: RewireOp },
    Arithmetic(ArithOp),
    Logic(LogicOp),
    Compare(CompareOp),
    /// Input 0 is the selector, inputs 1..=n the data inputs.
    Multiplexer { data_inputs: usize },
    /// Inputs alternate condition/value for each branch, the last input is
    /// the default. The first true condition wins.
    PriorityConditional { branches: usize },
    Register { flags: RegisterFlags },
    Pin { direction: PinDirection },
    Clk2Signal,
    /// Input 0 is consumed by the simulator, input 1 by the exporter.
    ExportOverride,
    /// Identity passthrough carrying backend metadata.
    Attributes { attributes: Vec<(String, String)> },
    SignalTap { level: TapLevel, trigger: TapTrigger },
    Memory(MemoryDesc),
    MemPort(MemPortDesc),
}

impl NodeKind {
    fn shape(&self) -> (usize, usize) {
        match self {
            NodeKind::Constant { .. } => (0, 1),
            NodeKind::Signal => (1, 1),
            NodeKind::Rewire { num_inputs, .. } => (*num_inputs, 1),
            NodeKind::Arithmetic(_) => (2, 1),
            NodeKind::Logic(LogicOp::Not) => (1, 1),
            NodeKind::Logic(_) => (2, 1),
            NodeKind::Compare(_) => (2, 1),
            NodeKind::Multiplexer { data_inputs } => (1 + data_inputs, 1),
            NodeKind::PriorityConditional { branches } => (2 * branches + 1, 1),
            NodeKind::Register { .. } => (3, 1),
            NodeKind::Pin { direction: PinDirection::Input } => (0, 1),
            NodeKind::Pin { direction: PinDirection::Output } => (1, 0),
            NodeKind::Pin { direction: PinDirection::BiDir } => (1, 1),
            NodeKind::Clk2Signal => (0, 1),
            NodeKind::ExportOverride => (2, 1),
            NodeKind::Attributes { .. } => (1, 1),
            NodeKind::SignalTap { .. } => (1, 0),
            NodeKind::Memory(_) => (0, 1),
            NodeKind::MemPort(_) => (5, 2),
        }
    }

    fn clock_ports(&self) -> usize {
        match self {
            NodeKind::Register { .. } | NodeKind::Clk2Signal => 1,
            NodeKind::MemPort(desc) if desc.writes => 1,
            _ => 0,
        }
    }
}

/// A node of the circuit graph: identity, diagnostics, ports, clock
/// side-inputs, and the kind payload that defines its behavior.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub name_inferred: bool,
    pub comment: String,
    pub group: Option<GroupId>,
    pub clocks: SmallVec<[Option<ClockId>; 1]>,
    /// Keep-alive count held by frontend handles; nonzero prevents culling.
    pub ref_count: usize,
    pub trace: Option<Arc<Backtrace>>,
    pub(crate) inputs: SmallVec<[InputPort; 3]>,
    pub(crate) outputs: SmallVec<[OutputPort; 1]>,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        let (num_inputs, num_outputs) = kind.shape();
        let mut outputs = SmallVec::with_capacity(num_outputs);
        for port in 0..num_outputs {
            outputs.push(OutputPort::new(
                default_output_type(&kind, port),
                default_output_kind(&kind, port),
            ));
        }
        Self {
            id,
            name: String::new(),
            name_inferred: false,
            comment: String::new(),
            group: None,
            clocks: smallvec::smallvec![None; kind.clock_ports()],
            ref_count: 0,
            trace: None,
            inputs: smallvec::smallvec![InputPort::default(); num_inputs],
            outputs,
            kind,
        }
    }

    pub fn record_stack_trace(&mut self) {
        self.trace = Some(Arc::new(Backtrace::capture()));
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.name_inferred = false;
    }

    pub fn set_inferred_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.name_inferred = true;
    }

    pub fn has_ref(&self) -> bool {
        self.ref_count > 0
    }

    pub fn num_input_ports(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_output_ports(&self) -> usize {
        self.outputs.len()
    }

    pub fn driver(&self, port: usize) -> Option<NodePort> {
        self.inputs[port].driver
    }

    pub fn output(&self, port: usize) -> &OutputPort {
        &self.outputs[port]
    }

    pub fn output_mut(&mut self, port: usize) -> &mut OutputPort {
        &mut self.outputs[port]
    }

    pub fn consumers(&self, port: usize) -> &[NodePort] {
        &self.outputs[port].consumers
    }

    pub fn is_orphaned(&self) -> bool {
        self.inputs.iter().all(|i| i.driver.is_none())
            && self.outputs.iter().all(|o| o.consumers.is_empty())
    }

    pub fn is_signal(&self) -> bool {
        matches!(self.kind, NodeKind::Signal)
    }

    /// Pure function of its inputs with no cycle-to-cycle state.
    pub fn is_combinational(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Constant { .. }
                | NodeKind::Signal
                | NodeKind::Rewire { .. }
                | NodeKind::Arithmetic(_)
                | NodeKind::Logic(_)
                | NodeKind::Compare(_)
                | NodeKind::Multiplexer { .. }
                | NodeKind::PriorityConditional { .. }
                | NodeKind::ExportOverride
                | NodeKind::Attributes { .. }
        )
    }

    /// Nodes that must survive culling even when nothing consumes them.
    pub fn has_side_effects(&self) -> bool {
        match &self.kind {
            NodeKind::Pin { direction } => !matches!(direction, PinDirection::Input),
            NodeKind::SignalTap { .. } => true,
            NodeKind::MemPort(desc) => desc.writes,
            _ => false,
        }
    }

    /// Register-like nodes whose outputs are ready at power-on for the
    /// purpose of topological ordering.
    pub fn output_ready_at_power_on(&self, port: usize) -> bool {
        match self.outputs[port].kind {
            OutputKind::Latched | OutputKind::Constant => true,
            OutputKind::Immediate => false,
        }
    }

    pub fn register_flags(&self) -> Option<RegisterFlags> {
        match &self.kind {
            NodeKind::Register { flags } => Some(*flags),
            _ => None,
        }
    }

    pub fn register_flags_mut(&mut self) -> Option<&mut RegisterFlags> {
        match &mut self.kind {
            NodeKind::Register { flags } => Some(flags),
            _ => None,
        }
    }

    /// Widths of per-node hidden state blocks, in declaration order.
    pub fn internal_state_sizes(&self) -> SmallVec<[usize; 2]> {
        match &self.kind {
            NodeKind::Register { .. } => {
                smallvec::smallvec![self.outputs[0].ty.width(), 1]
            }
            NodeKind::Pin { direction: PinDirection::Input | PinDirection::BiDir } => {
                smallvec::smallvec![self.outputs[0].ty.width()]
            }
            NodeKind::SignalTap { .. } => smallvec::smallvec![1],
            NodeKind::Memory(desc) => smallvec::smallvec![desc.size],
            NodeKind::MemPort(desc) => {
                smallvec::smallvec![ADDR_STATE_BITS, 1, desc.word_width]
            }
            _ => SmallVec::new(),
        }
    }

    /// Hidden state of *other* nodes this node addresses; resolved into
    /// extra entries of the internal offset array at compile time.
    pub fn referenced_internal_state(&self, circuit: &Circuit) -> Vec<(NodeId, usize)> {
        match &self.kind {
            NodeKind::MemPort(_) => match circuit.non_signal_driver(NodePort::new(self.id, MEMPORT_MEMORY)) {
                Some(memory) => vec![(memory.node, 0)],
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    pub fn type_name(&self) -> String {
        match &self.kind {
            NodeKind::Constant { .. } => "constant".into(),
            NodeKind::Signal => "signal".into(),
            NodeKind::Rewire { op, .. } => match op.is_bit_extract() {
                Some(bit) => format!("bit {}", bit),
                None => "rewire".into(),
            },
            NodeKind::Arithmetic(op) => match op {
                ArithOp::Add => "add".into(),
                ArithOp::Sub => "sub".into(),
                ArithOp::Mul => "mul".into(),
                ArithOp::Div => "div".into(),
                ArithOp::Rem => "rem".into(),
            },
            NodeKind::Logic(op) => match op {
                LogicOp::And => "and".into(),
                LogicOp::Nand => "nand".into(),
                LogicOp::Or => "or".into(),
                LogicOp::Nor => "nor".into(),
                LogicOp::Xor => "xor".into(),
                LogicOp::Xnor => "xnor".into(),
                LogicOp::Not => "not".into(),
            },
            NodeKind::Compare(op) => match op {
                CompareOp::Eq => "eq".into(),
                CompareOp::Neq => "neq".into(),
                CompareOp::Lt => "lt".into(),
                CompareOp::Gt => "gt".into(),
                CompareOp::Leq => "leq".into(),
                CompareOp::Geq => "geq".into(),
            },
            NodeKind::Multiplexer { .. } => "mux".into(),
            NodeKind::PriorityConditional { .. } => "prio".into(),
            NodeKind::Register { .. } => "register".into(),
            NodeKind::Pin { .. } => "pin".into(),
            NodeKind::Clk2Signal => "clk2signal".into(),
            NodeKind::ExportOverride => "export_override".into(),
            NodeKind::Attributes { .. } => "attributes".into(),
            NodeKind::SignalTap { .. } => "signal_tap".into(),
            NodeKind::Memory(_) => "memory".into(),
            NodeKind::MemPort(_) => "memory_port".into(),
        }
    }

    /// Clone for subnet copying: same payload and metadata, fresh ports,
    /// no driver/consumer wiring, clocks left for the caller to remap.
    pub fn clone_unconnected(&self, new_id: NodeId) -> Node {
        let mut clone = Node::new(new_id, self.kind.clone());
        clone.name = self.name.clone();
        clone.name_inferred = self.name_inferred;
        clone.comment = self.comment.clone();
        clone.trace = self.trace.clone();
        for (dst, src) in clone.outputs.iter_mut().zip(self.outputs.iter()) {
            dst.ty = src.ty;
            dst.kind = src.kind;
        }
        clone
    }

    /// Suggests a name for an unnamed downstream signal, derived from this
    /// node's operation and its drivers' names.
    pub fn attempt_infer_output_name(&self, circuit: &Circuit, _port: usize) -> Option<String> {
        let driver_name = |input: usize| -> Option<String> {
            let driver = self.driver(input)?;
            let name = &circuit.node(driver.node).name;
            if name.is_empty() { None } else { Some(name.clone()) }
        };
        match &self.kind {
            NodeKind::Register { .. } => Some(format!("{}_last", driver_name(REG_DATA)?)),
            NodeKind::Logic(op) => {
                let infix = match op {
                    LogicOp::And => "and",
                    LogicOp::Nand => "nand",
                    LogicOp::Or => "or",
                    LogicOp::Nor => "nor",
                    LogicOp::Xor => "xor",
                    LogicOp::Xnor => "xnor",
                    LogicOp::Not => return Some(format!("{}_not", driver_name(0)?)),
                };
                Some(format!("{}_{}_{}", driver_name(0)?, infix, driver_name(1)?))
            }
            NodeKind::Arithmetic(op) => {
                let infix = match op {
                    ArithOp::Add => "plus",
                    ArithOp::Sub => "minus",
                    ArithOp::Mul => "times",
                    ArithOp::Div => "over",
                    ArithOp::Rem => "mod",
                };
                Some(format!("{}_{}_{}", driver_name(0)?, infix, driver_name(1)?))
            }
            NodeKind::Compare(op) => {
                let infix = match op {
                    CompareOp::Eq => "eq",
                    CompareOp::Neq => "neq",
                    CompareOp::Lt => "lt",
                    CompareOp::Gt => "gt",
                    CompareOp::Leq => "leq",
                    CompareOp::Geq => "geq",
                };
                Some(format!("{}_{}_{}", driver_name(0)?, infix, driver_name(1)?))
            }
            NodeKind::Multiplexer { data_inputs } => {
                let longest = (1..=*data_inputs)
                    .filter_map(driver_name)
                    .max_by_key(|n| n.len())?;
                Some(format!("{}_mux", longest))
            }
            NodeKind::Rewire { op, .. } => {
                if let Some(bit) = op.is_bit_extract() {
                    return Some(format!("{}_bit_{}", driver_name(0)?, bit));
                }
                let mut parts = Vec::new();
                for i in 0..self.num_input_ports() {
                    let driver = self.driver(i)?;
                    if circuit.output_type(driver).is_dependency() {
                        continue;
                    }
                    parts.push(driver_name(i)?);
                }
                Some(format!("{}_rewired", parts.join("_")))
            }
            _ => None,
        }
    }
}

fn default_output_type(kind: &NodeKind, port: usize) -> ConnectionType {
    match kind {
        NodeKind::Constant { ty, .. } => *ty,
        NodeKind::Compare(_) | NodeKind::Clk2Signal | NodeKind::SignalTap { .. } => {
            ConnectionType::Bool
        }
        NodeKind::Memory(_) => ConnectionType::Dependency,
        NodeKind::MemPort(desc) => {
            if port == MEMPORT_RDDATA {
                ConnectionType::BitVec(desc.word_width)
            } else {
                ConnectionType::Dependency
            }
        }
        _ => ConnectionType::BitVec(0),
    }
}

fn default_output_kind(kind: &NodeKind, port: usize) -> OutputKind {
    match kind {
        NodeKind::Constant { .. } => OutputKind::Constant,
        NodeKind::Register { .. } | NodeKind::Pin { .. } | NodeKind::Clk2Signal => {
            OutputKind::Latched
        }
        NodeKind::MemPort(_) if port == MEMPORT_RDDATA => OutputKind::Latched,
        NodeKind::Memory(_) => OutputKind::Latched,
        _ => OutputKind::Immediate,
    }
}

// --- simulation behavior -------------------------------------------------

impl Node {
    /// Power-on initialization of outputs and internal state.
    pub fn simulate_reset(
        &self,
        circuit: &Circuit,
        state: &mut BitVecState,
        internal: &[usize],
        outputs: &[usize],
    ) {
        match &self.kind {
            NodeKind::Constant { value, .. } => {
                state.copy_range(outputs[0], value, 0, value.size());
            }
            NodeKind::Register { .. } => {
                let width = self.outputs[0].ty.width();
                match self.reset_constant(circuit) {
                    Some(value) => state.copy_range(outputs[0], &value, 0, width.min(value.size())),
                    None => {
                        state.clear_range(Plane::Defined, internal[REG_INT_DATA], width);
                        state.clear_range(Plane::Defined, outputs[0], width);
                    }
                }
            }
            NodeKind::Memory(desc) => match &desc.initial {
                Some(init) => state.copy_range(internal[0], init, 0, init.size().min(desc.size)),
                None => state.clear_range(Plane::Defined, internal[0], desc.size),
            },
            NodeKind::Pin { direction: PinDirection::Input | PinDirection::BiDir } => {
                let width = self.outputs[0].ty.width();
                state.clear_range(Plane::Defined, internal[0], width);
                state.clear_range(Plane::Defined, outputs[0], width);
            }
            NodeKind::Clk2Signal => {
                state.set(Plane::Defined, outputs[0], true);
                state.set(Plane::Value, outputs[0], false);
            }
            NodeKind::SignalTap { .. } => {
                state.set(Plane::Defined, internal[0], true);
                state.set(Plane::Value, internal[0], false);
            }
            _ => {}
        }
    }

    /// Resolves the reset value through signal nodes to a constant payload.
    pub fn reset_constant(&self, circuit: &Circuit) -> Option<BitVecState> {
        let driver = circuit.non_signal_driver(NodePort::new(self.id, REG_RESET_VALUE))?;
        match &circuit.node(driver.node).kind {
            NodeKind::Constant { value, .. } => Some(value.clone()),
            _ => None,
        }
    }

    /// Combinational evaluation. `inputs[i]` is the state offset of the
    /// driver of input `i` or [`UNCONNECTED`].
    pub fn simulate_evaluate(
        &self,
        circuit: &Circuit,
        state: &mut BitVecState,
        internal: &[usize],
        inputs: &[usize],
        outputs: &[usize],
    ) {
        match &self.kind {
            NodeKind::Constant { value, .. } => {
                state.copy_range(outputs[0], value, 0, value.size());
            }
            NodeKind::Signal | NodeKind::ExportOverride => {
                // Aliased onto the driver's range at compile time.
            }
            NodeKind::Attributes { .. } => {
                let width = self.outputs[0].ty.width();
                if inputs[0] == UNCONNECTED {
                    state.clear_range(Plane::Defined, outputs[0], width);
                } else {
                    state.copy_range_within(outputs[0], inputs[0], width);
                }
            }
            NodeKind::Rewire { op, .. } => self.eval_rewire(op, state, inputs, outputs),
            NodeKind::Logic(op) => self.eval_logic(*op, state, inputs, outputs),
            NodeKind::Arithmetic(op) => self.eval_arithmetic(*op, state, inputs, outputs),
            NodeKind::Compare(op) => self.eval_compare(*op, circuit, state, inputs, outputs),
            NodeKind::Multiplexer { data_inputs } => {
                self.eval_multiplexer(*data_inputs, circuit, state, inputs, outputs)
            }
            NodeKind::PriorityConditional { branches } => {
                self.eval_priority(*branches, state, inputs, outputs)
            }
            NodeKind::Register { .. } => {
                let width = self.outputs[0].ty.width();
                if inputs[REG_DATA] == UNCONNECTED {
                    state.clear_range(Plane::Defined, internal[REG_INT_DATA], width);
                } else {
                    state.copy_range_within(internal[REG_INT_DATA], inputs[REG_DATA], width);
                }
                if inputs[REG_ENABLE] == UNCONNECTED {
                    state.set(Plane::Defined, internal[REG_INT_ENABLE], true);
                    state.set(Plane::Value, internal[REG_INT_ENABLE], true);
                } else {
                    state.copy_range_within(internal[REG_INT_ENABLE], inputs[REG_ENABLE], 1);
                }
            }
            NodeKind::Pin { direction } => match direction {
                PinDirection::Input | PinDirection::BiDir => {
                    let width = self.outputs[0].ty.width();
                    state.copy_range_within(outputs[0], internal[0], width);
                }
                PinDirection::Output => {}
            },
            NodeKind::MemPort(desc) => self.eval_mem_port(desc, circuit, state, internal, inputs, outputs),
            NodeKind::Clk2Signal | NodeKind::SignalTap { .. } | NodeKind::Memory(_) => {}
        }
    }

    fn eval_rewire(
        &self,
        op: &RewireOp,
        state: &mut BitVecState,
        inputs: &[usize],
        outputs: &[usize],
    ) {
        let mut out_offset = 0;
        for range in &op.ranges {
            match range.source {
                RangeSource::Input { index, offset } => {
                    if inputs[index] == UNCONNECTED {
                        state.clear_range(Plane::Defined, outputs[0] + out_offset, range.subwidth);
                    } else {
                        state.copy_range_within(outputs[0] + out_offset, inputs[index] + offset, range.subwidth);
                    }
                }
                RangeSource::ConstZero | RangeSource::ConstOne => {
                    state.set_range(Plane::Defined, outputs[0] + out_offset, range.subwidth);
                    state.set_range_to(
                        Plane::Value,
                        outputs[0] + out_offset,
                        range.subwidth,
                        matches!(range.source, RangeSource::ConstOne),
                    );
                }
                RangeSource::ConstUndefined => {
                    state.clear_range(Plane::Defined, outputs[0] + out_offset, range.subwidth);
                }
            }
            out_offset += range.subwidth;
        }
    }

    fn eval_logic(&self, op: LogicOp, state: &mut BitVecState, inputs: &[usize], outputs: &[usize]) {
        let width = self.outputs[0].ty.width();
        let mut offset = 0;
        while offset < width {
            let chunk = (width - offset).min(64);
            let chunk_mask = if chunk >= 64 { !0u64 } else { (1u64 << chunk) - 1 };

            let (left, left_defined) = if inputs[0] == UNCONNECTED {
                (0, 0)
            } else {
                (
                    state.extract(Plane::Value, inputs[0] + offset, chunk),
                    state.extract(Plane::Defined, inputs[0] + offset, chunk),
                )
            };
            let (right, right_defined) = if op == LogicOp::Not || inputs[1] == UNCONNECTED {
                (0, 0)
            } else {
                (
                    state.extract(Plane::Value, inputs[1] + offset, chunk),
                    state.extract(Plane::Defined, inputs[1] + offset, chunk),
                )
            };

            // A defined dominant operand (0 for AND, 1 for OR) keeps the
            // result defined even when the other side is undefined.
            let (result, defined) = match op {
                LogicOp::And => (
                    left & right,
                    (left_defined & !left) | (right_defined & !right) | (left_defined & right_defined),
                ),
                LogicOp::Nand => (
                    !(left & right),
                    (left_defined & !left) | (right_defined & !right) | (left_defined & right_defined),
                ),
                LogicOp::Or => (
                    left | right,
                    (left_defined & left) | (right_defined & right) | (left_defined & right_defined),
                ),
                LogicOp::Nor => (
                    !(left | right),
                    (left_defined & left) | (right_defined & right) | (left_defined & right_defined),
                ),
                LogicOp::Xor => (left ^ right, left_defined & right_defined),
                LogicOp::Xnor => (!(left ^ right), left_defined & right_defined),
                LogicOp::Not => (!left, left_defined),
            };

            state.insert(Plane::Value, outputs[0] + offset, chunk, result & chunk_mask);
            state.insert(Plane::Defined, outputs[0] + offset, chunk, defined & chunk_mask);
            offset += chunk;
        }
    }

    fn eval_arithmetic(
        &self,
        op: ArithOp,
        state: &mut BitVecState,
        inputs: &[usize],
        outputs: &[usize],
    ) {
        let width = self.outputs[0].ty.width();
        let defined = inputs[0] != UNCONNECTED
            && inputs[1] != UNCONNECTED
            && state.all_defined(inputs[0], width)
            && state.all_defined(inputs[1], width);
        if !defined {
            state.clear_range(Plane::Defined, outputs[0], width);
            return;
        }

        let a = state.to_biguint(Plane::Value, inputs[0], width);
        let b = state.to_biguint(Plane::Value, inputs[1], width);
        let modulus = BigUint::from(1u8) << width;

        let result = match op {
            ArithOp::Add => (a + b) % &modulus,
            ArithOp::Sub => (a + &modulus - b) % &modulus,
            ArithOp::Mul => (a * b) % &modulus,
            ArithOp::Div => {
                if b.is_zero() {
                    state.clear_range(Plane::Defined, outputs[0], width);
                    return;
                }
                a / b
            }
            ArithOp::Rem => {
                if b.is_zero() {
                    state.clear_range(Plane::Defined, outputs[0], width);
                    return;
                }
                a % b
            }
        };

        state.insert_biguint(Plane::Value, outputs[0], width, &result);
        state.set_range(Plane::Defined, outputs[0], width);
    }

    fn eval_compare(
        &self,
        op: CompareOp,
        circuit: &Circuit,
        state: &mut BitVecState,
        inputs: &[usize],
        outputs: &[usize],
    ) {
        let width = self
            .driver(0)
            .map(|d| circuit.output_type(d).width())
            .unwrap_or(0);
        let defined = inputs[0] != UNCONNECTED
            && inputs[1] != UNCONNECTED
            && state.all_defined(inputs[0], width)
            && state.all_defined(inputs[1], width);
        if !defined {
            state.set(Plane::Defined, outputs[0], false);
            return;
        }

        let a = state.to_biguint(Plane::Value, inputs[0], width);
        let b = state.to_biguint(Plane::Value, inputs[1], width);
        let result = match op {
            CompareOp::Eq => a == b,
            CompareOp::Neq => a != b,
            CompareOp::Lt => a < b,
            CompareOp::Gt => a > b,
            CompareOp::Leq => a <= b,
            CompareOp::Geq => a >= b,
        };
        state.set(Plane::Defined, outputs[0], true);
        state.set(Plane::Value, outputs[0], result);
    }

    fn eval_multiplexer(
        &self,
        data_inputs: usize,
        circuit: &Circuit,
        state: &mut BitVecState,
        inputs: &[usize],
        outputs: &[usize],
    ) {
        let width = self.outputs[0].ty.width();
        if inputs[0] == UNCONNECTED {
            state.clear_range(Plane::Defined, outputs[0], width);
            return;
        }
        let selector_width = self
            .driver(0)
            .map(|d| circuit.output_type(d).width())
            .unwrap_or(0);

        if !state.all_defined(inputs[0], selector_width) {
            // Undefined selector: a bit stays defined only where every data
            // input agrees on its value.
            for b in 0..width {
                let mut value = false;
                let mut defined = false;
                if inputs[1] != UNCONNECTED {
                    value = state.get(Plane::Value, inputs[1] + b);
                    defined = state.get(Plane::Defined, inputs[1] + b);
                }
                if defined {
                    for i in 2..=data_inputs {
                        if inputs[i] == UNCONNECTED
                            || !state.get(Plane::Defined, inputs[i] + b)
                            || state.get(Plane::Value, inputs[i] + b) != value
                        {
                            defined = false;
                            break;
                        }
                    }
                }
                state.set(Plane::Value, outputs[0] + b, value);
                state.set(Plane::Defined, outputs[0] + b, defined);
            }
            return;
        }

        let selector = if selector_width > 64 {
            u64::MAX
        } else {
            state.extract(Plane::Value, inputs[0], selector_width)
        };
        if selector as usize >= data_inputs || inputs[1 + selector as usize] == UNCONNECTED {
            state.clear_range(Plane::Defined, outputs[0], width);
            return;
        }
        state.copy_range_within(outputs[0], inputs[1 + selector as usize], width);
    }

    fn eval_priority(
        &self,
        branches: usize,
        state: &mut BitVecState,
        inputs: &[usize],
        outputs: &[usize],
    ) {
        let width = self.outputs[0].ty.width();
        let default_input = 2 * branches;

        let mut candidates: Vec<usize> = Vec::new();
        for branch in 0..branches {
            let cond = inputs[2 * branch];
            if cond == UNCONNECTED || !state.get(Plane::Defined, cond) {
                // Undefined condition: this and everything below may win.
                candidates.push(2 * branch + 1);
                continue;
            }
            if state.get(Plane::Value, cond) {
                if candidates.is_empty() {
                    let value = inputs[2 * branch + 1];
                    if value == UNCONNECTED {
                        state.clear_range(Plane::Defined, outputs[0], width);
                    } else {
                        state.copy_range_within(outputs[0], value, width);
                    }
                    return;
                }
                candidates.push(2 * branch + 1);
                break;
            }
        }
        if candidates.is_empty() {
            if inputs[default_input] == UNCONNECTED {
                state.clear_range(Plane::Defined, outputs[0], width);
            } else {
                state.copy_range_within(outputs[0], inputs[default_input], width);
            }
            return;
        }
        candidates.push(default_input);

        // Ambiguous winner: output bits stay defined only where all
        // remaining candidates agree.
        for b in 0..width {
            let first = inputs[candidates[0]];
            let mut value = false;
            let mut defined = false;
            if first != UNCONNECTED {
                value = state.get(Plane::Value, first + b);
                defined = state.get(Plane::Defined, first + b);
            }
            if defined {
                for &c in &candidates[1..] {
                    if inputs[c] == UNCONNECTED
                        || !state.get(Plane::Defined, inputs[c] + b)
                        || state.get(Plane::Value, inputs[c] + b) != value
                    {
                        defined = false;
                        break;
                    }
                }
            }
            state.set(Plane::Value, outputs[0] + b, value);
            state.set(Plane::Defined, outputs[0] + b, defined);
        }
    }

    fn eval_mem_port(
        &self,
        desc: &MemPortDesc,
        circuit: &Circuit,
        state: &mut BitVecState,
        internal: &[usize],
        inputs: &[usize],
        outputs: &[usize],
    ) {
        // Latch address, enable, and write data for the next clock advance.
        if inputs[MEMPORT_ADDRESS] == UNCONNECTED {
            state.clear_range(Plane::Defined, internal[MEMPORT_INT_ADDR], ADDR_STATE_BITS);
        } else {
            let addr_width = self
                .driver(MEMPORT_ADDRESS)
                .map(|d| circuit.output_type(d).width())
                .unwrap_or(0)
                .min(ADDR_STATE_BITS);
            state.clear_range(Plane::Value, internal[MEMPORT_INT_ADDR], ADDR_STATE_BITS);
            state.set_range(Plane::Defined, internal[MEMPORT_INT_ADDR], ADDR_STATE_BITS);
            state.copy_range_within(internal[MEMPORT_INT_ADDR], inputs[MEMPORT_ADDRESS], addr_width);
        }
        if inputs[MEMPORT_ENABLE] == UNCONNECTED {
            state.set(Plane::Defined, internal[MEMPORT_INT_ENABLE], true);
            state.set(Plane::Value, internal[MEMPORT_INT_ENABLE], true);
        } else {
            state.copy_range_within(internal[MEMPORT_INT_ENABLE], inputs[MEMPORT_ENABLE], 1);
        }
        if desc.writes && inputs[MEMPORT_WRDATA] != UNCONNECTED {
            state.copy_range_within(internal[MEMPORT_INT_WRDATA], inputs[MEMPORT_WRDATA], desc.word_width);
        } else if desc.writes {
            state.clear_range(Plane::Defined, internal[MEMPORT_INT_WRDATA], desc.word_width);
        }

        // Asynchronous read of the current memory content.
        if desc.reads {
            let Some(memory) = self.memory_node(circuit) else {
                state.clear_range(Plane::Defined, outputs[MEMPORT_RDDATA], desc.word_width);
                return;
            };
            let mem_size = match &circuit.node(memory).kind {
                NodeKind::Memory(m) => m.size,
                _ => 0,
            };
            let mem_offset = internal[MEMPORT_INT_MEMORY];
            let addr_defined = state.all_defined(internal[MEMPORT_INT_ADDR], ADDR_STATE_BITS);
            let addr = state.extract(Plane::Value, internal[MEMPORT_INT_ADDR], ADDR_STATE_BITS) as usize;
            if !addr_defined || (addr + 1).saturating_mul(desc.word_width) > mem_size {
                state.clear_range(Plane::Defined, outputs[MEMPORT_RDDATA], desc.word_width);
            } else {
                state.copy_range_within(outputs[MEMPORT_RDDATA], mem_offset + addr * desc.word_width, desc.word_width);
            }
        }
    }

    /// The memory node this port is attached to.
    pub fn memory_node(&self, circuit: &Circuit) -> Option<NodeId> {
        circuit
            .non_signal_driver(NodePort::new(self.id, MEMPORT_MEMORY))
            .map(|np| np.node)
    }

    /// Clocked state advance at the start of a triggering edge's DURING phase.
    pub fn simulate_advance(
        &self,
        circuit: &Circuit,
        state: &mut BitVecState,
        internal: &[usize],
        outputs: &[usize],
        clock_port: usize,
    ) {
        debug_assert_eq!(clock_port, 0);
        match &self.kind {
            NodeKind::Register { .. } => {
                let width = self.outputs[0].ty.width();
                let enable_defined = state.get(Plane::Defined, internal[REG_INT_ENABLE]);
                let enable = state.get(Plane::Value, internal[REG_INT_ENABLE]);
                if !enable_defined {
                    state.clear_range(Plane::Defined, outputs[0], width);
                } else if enable {
                    state.copy_range_within(outputs[0], internal[REG_INT_DATA], width);
                }
            }
            NodeKind::MemPort(desc) if desc.writes => {
                let Some(memory) = self.memory_node(circuit) else { return };
                let mem_size = match &circuit.node(memory).kind {
                    NodeKind::Memory(m) => m.size,
                    _ => return,
                };
                let mem_offset = internal[MEMPORT_INT_MEMORY];
                let enable_defined = state.get(Plane::Defined, internal[MEMPORT_INT_ENABLE]);
                let enable = state.get(Plane::Value, internal[MEMPORT_INT_ENABLE]);
                if enable_defined && !enable {
                    return;
                }
                let addr_defined = state.all_defined(internal[MEMPORT_INT_ADDR], ADDR_STATE_BITS);
                if !enable_defined || !addr_defined {
                    // A write that may or may not happen, to an unknown
                    // address, clobbers the whole content.
                    state.clear_range(Plane::Defined, mem_offset, mem_size);
                    return;
                }
                let addr = state.extract(Plane::Value, internal[MEMPORT_INT_ADDR], ADDR_STATE_BITS) as usize;
                if (addr + 1).saturating_mul(desc.word_width) > mem_size {
                    return;
                }
                state.copy_range_within(mem_offset + addr * desc.word_width, internal[MEMPORT_INT_WRDATA], desc.word_width);
            }
            _ => {}
        }
    }

    /// Loads the reset value into the output; used for synchronous resets
    /// at a triggering edge and asynchronous resets on assertion.
    pub fn simulate_reset_change(
        &self,
        circuit: &Circuit,
        state: &mut BitVecState,
        outputs: &[usize],
        reset_asserted: bool,
    ) {
        if !reset_asserted {
            return;
        }
        if let NodeKind::Register { .. } = &self.kind {
            let width = self.outputs[0].ty.width();
            match self.reset_constant(circuit) {
                Some(value) => state.copy_range(outputs[0], &value, 0, width.min(value.size())),
                None => state.clear_range(Plane::Defined, outputs[0], width),
            }
        }
    }

    /// Follows the clock pin level; used by clock-to-signal nodes.
    pub fn simulate_clock_change(
        &self,
        state: &mut BitVecState,
        outputs: &[usize],
        clock_value: bool,
        clock_defined: bool,
    ) {
        if let NodeKind::Clk2Signal = &self.kind {
            state.set(Plane::Value, outputs[0], clock_value);
            state.set(Plane::Defined, outputs[0], clock_defined);
        }
    }

    /// End-of-tick commit; signal taps fire their diagnostics here, on the
    /// transition of their condition into the triggering state.
    pub fn simulate_commit(
        &self,
        state: &mut BitVecState,
        internal: &[usize],
        inputs: &[usize],
        callbacks: &mut dyn SimulatorCallbacks,
    ) {
        if let NodeKind::SignalTap { level, trigger } = &self.kind {
            let (value, defined) = if inputs[0] == UNCONNECTED {
                (false, false)
            } else {
                (
                    state.get(Plane::Value, inputs[0]),
                    state.get(Plane::Defined, inputs[0]),
                )
            };
            let active = defined
                && match trigger {
                    TapTrigger::FirstInputHigh => value,
                    TapTrigger::FirstInputLow => !value,
                };
            let was_active = state.get(Plane::Value, internal[0]);
            if active && !was_active {
                let msg = if self.comment.is_empty() {
                    self.name.clone()
                } else {
                    self.comment.clone()
                };
                match level {
                    TapLevel::Assert => callbacks.on_assert(self.id, &msg),
                    TapLevel::Warn => callbacks.on_warning(self.id, &msg),
                    TapLevel::Debug => callbacks.on_debug_message(self.id, &msg),
                }
            }
            state.set(Plane::Value, internal[0], active);
        }
    }
}
