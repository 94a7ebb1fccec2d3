use smallvec::SmallVec;

use crate::HashMap;
use crate::circuit::Circuit;
use crate::clock::{allocate_clock_pins, ClockId, ClockPinAllocation};
use crate::errors::{DesignError, Result};
use crate::node::{NodeId, NodeKind, NodePort, EXPORT_SIM};
use crate::state::{BitVecState, UNCONNECTED};
use crate::subnet::Subnet;

use super::SimulatorCallbacks;

/// First-fit bit range allocator for the packed state vector.
#[derive(Debug, Default)]
struct BitAllocator {
    next: usize,
}

impl BitAllocator {
    fn allocate(&mut self, width: usize) -> usize {
        let offset = self.next;
        self.next += width;
        offset
    }

    fn total(&self) -> usize {
        self.next
    }
}

/// A node with its state offsets resolved: internal state blocks (own plus
/// referenced), input driver offsets ([`UNCONNECTED`] when absent), and
/// output offsets.
#[derive(Debug, Clone)]
pub struct MappedNode {
    pub node: NodeId,
    pub internal: SmallVec<[usize; 4]>,
    pub inputs: SmallVec<[usize; 4]>,
    pub outputs: SmallVec<[usize; 2]>,
}

/// Topologically ordered nodes evaluated as one unit.
#[derive(Debug, Default)]
pub struct ExecutionBlock {
    pub(crate) steps: Vec<MappedNode>,
}

impl ExecutionBlock {
    pub fn evaluate(&self, circuit: &Circuit, state: &mut BitVecState) {
        for step in &self.steps {
            circuit.node(step.node).simulate_evaluate(
                circuit,
                state,
                &step.internal,
                &step.inputs,
                &step.outputs,
            );
        }
    }

    pub fn commit(
        &self,
        circuit: &Circuit,
        state: &mut BitVecState,
        callbacks: &mut dyn SimulatorCallbacks,
    ) {
        for step in &self.steps {
            circuit.node(step.node).simulate_commit(state, &step.internal, &step.inputs, callbacks);
        }
    }
}

/// A clocked node within a clock domain, keeping its logical clock so
/// per-clock reset semantics survive pin sharing.
#[derive(Debug, Clone)]
pub struct ClockedNode {
    pub mapped: MappedNode,
    pub clock_port: usize,
    pub clock: ClockId,
}

/// All nodes advanced by one physical clock pin, plus the execution blocks
/// that must re-evaluate after a trigger.
#[derive(Debug, Default)]
pub struct ClockDomain {
    pub clocked_nodes: Vec<ClockedNode>,
    pub dependent_blocks: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct StateMapping {
    pub output_offsets: HashMap<NodePort, usize>,
    pub node_internal: HashMap<NodeId, SmallVec<[usize; 4]>>,
}

impl StateMapping {
    pub fn output_offset(&self, output: NodePort) -> Option<usize> {
        self.output_offsets.get(&output).copied()
    }
}

/// The compiled form of a circuit: packed state layout, power-on list,
/// topologically ordered execution blocks, and per-clock-pin domains.
/// Immutable for the duration of a run; the circuit is owned and must not
/// change underneath it.
#[derive(Debug)]
pub struct Program {
    pub circuit: Circuit,
    pub subnet: Subnet,
    pub state_width: usize,
    pub mapping: StateMapping,
    pub power_on_nodes: Vec<MappedNode>,
    pub pin_allocation: ClockPinAllocation,
    pub clock_domains: Vec<ClockDomain>,
    pub execution_blocks: Vec<ExecutionBlock>,
}

/// Follows an input's driver through signal identities and the simulation
/// side of export overrides to the producing output.
pub fn real_driver(circuit: &Circuit, input: NodePort) -> Option<NodePort> {
    let mut driver = circuit.driver(input)?;
    loop {
        match &circuit.node(driver.node).kind {
            NodeKind::Signal => driver = circuit.node(driver.node).driver(0)?,
            NodeKind::ExportOverride => {
                driver = circuit.node(driver.node).driver(EXPORT_SIM)?
            }
            _ => return Some(driver),
        }
    }
}

impl Program {
    /// Compiles the subnet relevant for simulation. `outputs` confines the
    /// program to the cone driving those ports; empty means everything
    /// with side effects or frontend references.
    pub fn compile(circuit: Circuit, outputs: &[NodePort]) -> Result<Program> {
        let subnet = Subnet::all_for_simulation(&circuit, outputs);

        let mut allocator = BitAllocator::default();
        let mut mapping = StateMapping::default();

        // Pass 1: allocate output ranges and per-node internal state.
        // Signals and export overrides alias their driver's range.
        for id in subnet.iter() {
            let node = circuit.node(id);
            match &node.kind {
                NodeKind::Signal | NodeKind::ExportOverride => {
                    let width = node.output(0).ty.width();
                    match real_driver(&circuit, NodePort::new(id, 0)) {
                        Some(src) => {
                            let offset = match mapping.output_offsets.get(&src) {
                                Some(&offset) => offset,
                                None => {
                                    let offset = allocator.allocate(width);
                                    mapping.output_offsets.insert(src, offset);
                                    offset
                                }
                            };
                            mapping.output_offsets.insert(NodePort::new(id, 0), offset);
                        }
                        None => {
                            let offset = allocator.allocate(width);
                            mapping.output_offsets.insert(NodePort::new(id, 0), offset);
                        }
                    }
                }
                _ => {
                    let mut internal: SmallVec<[usize; 4]> = SmallVec::new();
                    for size in node.internal_state_sizes() {
                        internal.push(allocator.allocate(size));
                    }
                    mapping.node_internal.insert(id, internal);

                    for port in 0..node.num_output_ports() {
                        let np = NodePort::new(id, port);
                        mapping
                            .output_offsets
                            .entry(np)
                            .or_insert_with(|| allocator.allocate(node.output(port).ty.width()));
                    }
                }
            }
        }

        // Pass 2: resolve references into other nodes' internal state.
        for id in subnet.iter() {
            let refs = circuit.node(id).referenced_internal_state(&circuit);
            if refs.is_empty() {
                continue;
            }
            let mut resolved: SmallVec<[usize; 4]> = SmallVec::new();
            for (target, idx) in refs {
                let target_internal = mapping
                    .node_internal
                    .get(&target)
                    .ok_or(DesignError::UnresolvedReference { node: target })?;
                resolved.push(target_internal[idx]);
            }
            if let Some(internal) = mapping.node_internal.get_mut(&id) {
                internal.extend(resolved);
            }
        }

        let make_mapped = |id: NodeId| -> MappedNode {
            let node = circuit.node(id);
            let mut inputs: SmallVec<[usize; 4]> = SmallVec::new();
            for port in 0..node.num_input_ports() {
                let offset = real_driver(&circuit, NodePort::new(id, port))
                    .and_then(|d| mapping.output_offset(d))
                    .unwrap_or(UNCONNECTED);
                inputs.push(offset);
            }
            let mut outs: SmallVec<[usize; 2]> = SmallVec::new();
            for port in 0..node.num_output_ports() {
                outs.push(mapping.output_offset(NodePort::new(id, port)).unwrap_or(UNCONNECTED));
            }
            MappedNode {
                node: id,
                internal: mapping.node_internal.get(&id).cloned().unwrap_or_default(),
                inputs,
                outputs: outs,
            }
        };

        // Everything with its own storage runs its power-on reset.
        let mut power_on_nodes = Vec::new();
        for id in subnet.iter() {
            if matches!(
                circuit.node(id).kind,
                NodeKind::Signal | NodeKind::ExportOverride
            ) {
                continue;
            }
            power_on_nodes.push(make_mapped(id));
        }

        let pin_allocation = allocate_clock_pins(&circuit, &subnet);

        let mut clock_domains: Vec<ClockDomain> = Vec::new();
        clock_domains.resize_with(pin_allocation.clock_pins.len(), ClockDomain::default);
        for id in subnet.iter() {
            let node = circuit.node(id);
            for clock_port in 0..node.clocks.len() {
                let Some(clock) = node.clocks[clock_port] else { continue };
                let pin_source = circuit.clock_pin_source(clock);
                let Some(&pin) = pin_allocation.clock_to_pin.get(&pin_source) else { continue };
                let domain = &mut clock_domains[pin];
                domain.clocked_nodes.push(ClockedNode {
                    mapped: make_mapped(id),
                    clock_port,
                    clock,
                });
                if domain.dependent_blocks.is_empty() {
                    domain.dependent_blocks.push(0);
                }
            }
        }

        // Topological order by output-ready propagation. Latched and
        // constant outputs break feedback loops through state.
        let mut ready: crate::HashSet<NodePort> = crate::HashSet::default();
        let mut remaining: Vec<NodeId> = Vec::new();
        for id in subnet.iter() {
            let node = circuit.node(id);
            if matches!(node.kind, NodeKind::Signal | NodeKind::ExportOverride) {
                continue;
            }
            remaining.push(id);
            for port in 0..node.num_output_ports() {
                if node.output_ready_at_power_on(port) {
                    ready.insert(NodePort::new(id, port));
                }
            }
        }

        let mut block = ExecutionBlock::default();
        while !remaining.is_empty() {
            let position = remaining.iter().position(|&id| {
                let node = circuit.node(id);
                (0..node.num_input_ports()).all(|port| {
                    match real_driver(&circuit, NodePort::new(id, port)) {
                        Some(driver) => ready.contains(&driver),
                        None => true,
                    }
                })
            });

            let Some(position) = position else {
                return Err(cycle_error(&circuit, &remaining));
            };
            let id = remaining.remove(position);
            let node = circuit.node(id);
            for port in 0..node.num_output_ports() {
                ready.insert(NodePort::new(id, port));
            }
            block.steps.push(make_mapped(id));
        }

        Ok(Program {
            circuit,
            subnet,
            state_width: allocator.total(),
            mapping,
            power_on_nodes,
            pin_allocation,
            clock_domains,
            execution_blocks: vec![block],
        })
    }

    pub fn output_width(&self, output: NodePort) -> usize {
        self.circuit.node(output.node).output(output.port).ty.width()
    }
}

/// No node is placeable: some subset has mutually unsatisfiable
/// dependencies. Peel everything not on a cycle and report the rest.
fn cycle_error(circuit: &Circuit, remaining: &[NodeId]) -> DesignError {
    let mut unsatisfied = Subnet::new();
    for id in remaining {
        unsatisfied.insert(*id);
    }
    let loop_nodes = unsatisfied.filter_loop_nodes_only(circuit);
    let report_set = if loop_nodes.is_empty() { &unsatisfied } else { &loop_nodes };

    let mut report = String::new();
    for id in report_set.iter() {
        let node = circuit.node(id);
        report.push_str(&format!(
            "  {} ({}{}{})\n",
            id,
            node.type_name(),
            if node.name.is_empty() { "" } else { ", " },
            node.name
        ));
        if let Some(trace) = &node.trace {
            report.push_str(&format!("    constructed at:\n{}\n", trace));
        }
    }
    DesignError::CombinationalCycle { count: report_set.len(), report }
}
