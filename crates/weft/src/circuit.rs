use crate::HashMap;
use crate::clock::{Clock, ClockId};
use crate::errors::{DesignError, Result};
use crate::group::{GroupId, GroupType, NodeGroup};
use crate::node::{
    ConnectionType, MemPortDesc, Node, NodeId, NodeKind, NodePort, OutputKind, RangeSource,
    RewireOp, MEMPORT_ENABLE, MEMPORT_MEMORY, MEMPORT_WRDATA, REG_DATA, REG_ENABLE,
    REG_RESET_VALUE,
};

/// Owns the nodes, clocks, and node groups of one design and hands out the
/// ids everything else refers to. Node slots are tombstoned on removal so
/// ids stay stable for the lifetime of the circuit.
#[derive(Debug)]
pub struct Circuit {
    nodes: Vec<Option<Node>>,
    clocks: Vec<Clock>,
    groups: Vec<NodeGroup>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

impl Circuit {
    pub fn new() -> Self {
        let mut root = NodeGroup::new(GroupId(0), None, GroupType::Entity);
        root.name = "top".into();
        Self { nodes: Vec::new(), clocks: Vec::new(), groups: vec![root] }
    }

    // --- nodes -----------------------------------------------------------

    pub fn create_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u64);
        let mut node = Node::new(id, kind);
        node.group = Some(self.root_group());
        node.record_stack_trace();
        self.nodes.push(Some(node));
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.index()].as_ref().expect("node was removed")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.index()].as_mut().expect("node was removed")
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.get(id.index()).is_some_and(|slot| slot.is_some())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter_map(|slot| slot.as_ref())
    }

    /// Live node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes().map(|n| n.id).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    /// Upper bound for dense id-indexed tables.
    pub fn node_id_bound(&self) -> usize {
        self.nodes.len()
    }

    /// Removes a node, unhooking it from its drivers. The node must not
    /// drive anything anymore; bypass its consumers first.
    pub fn remove_node(&mut self, id: NodeId) {
        for port in 0..self.node(id).num_input_ports() {
            self.disconnect_input(NodePort::new(id, port));
        }
        let node = self.nodes[id.index()].take().expect("node was removed");
        debug_assert!(
            node.outputs.iter().all(|o| o.consumers.is_empty()),
            "removing a node that still drives consumers"
        );
    }

    // --- wiring ----------------------------------------------------------

    pub fn output_type(&self, output: NodePort) -> ConnectionType {
        self.node(output.node).output(output.port).ty
    }

    pub fn output_kind(&self, output: NodePort) -> OutputKind {
        self.node(output.node).output(output.port).kind
    }

    pub fn driver(&self, input: NodePort) -> Option<NodePort> {
        self.node(input.node).driver(input.port)
    }

    /// Follows the driver of an input port through signal identity nodes.
    pub fn non_signal_driver(&self, input: NodePort) -> Option<NodePort> {
        let mut driver = self.driver(input)?;
        while self.node(driver.node).is_signal() {
            driver = self.node(driver.node).driver(0)?;
        }
        Some(driver)
    }

    /// Connects `output` to `input`, propagating connection types into the
    /// consuming node. Idempotent when the connection already exists; fails
    /// when the consuming node kind rejects the driver's type.
    pub fn connect_input(&mut self, input: NodePort, output: NodePort) -> Result<()> {
        if input.port >= self.node(input.node).num_input_ports() {
            return Err(DesignError::IllegalConnection {
                node: input.node,
                reason: format!("input port {} out of range", input.port),
            });
        }
        if self.driver(input) == Some(output) {
            return Ok(());
        }
        self.check_and_adopt_type(input, output)?;
        self.disconnect_input(input);
        self.node_mut(input.node).inputs[input.port].driver = Some(output);
        self.node_mut(output.node).outputs[output.port].consumers.push(input);
        self.refresh_output_kind(input.node);
        Ok(())
    }

    /// Atomic driver swap without type re-propagation; the rewrite passes
    /// use this when types are known to match.
    pub fn rewire_input(&mut self, input: NodePort, new_output: NodePort) {
        self.disconnect_input(input);
        self.node_mut(input.node).inputs[input.port].driver = Some(new_output);
        self.node_mut(new_output.node).outputs[new_output.port].consumers.push(input);
        self.refresh_output_kind(input.node);
    }

    pub fn disconnect_input(&mut self, input: NodePort) {
        let Some(old) = self.driver(input) else { return };
        self.node_mut(input.node).inputs[input.port].driver = None;
        let consumers = &mut self.node_mut(old.node).outputs[old.port].consumers;
        if let Some(pos) = consumers.iter().position(|c| *c == input) {
            consumers.swap_remove(pos);
        }
    }

    /// Redirects all consumers of output `output_port` of `node` to
    /// whatever drives its input `input_port`. The backbone of every
    /// peephole bypass.
    pub fn bypass_output_to_input(&mut self, node: NodeId, output_port: usize, input_port: usize) {
        let replacement = self.driver(NodePort::new(node, input_port));
        let consumers: Vec<NodePort> =
            self.node(node).consumers(output_port).to_vec();
        for consumer in consumers {
            match replacement {
                Some(driver) => self.rewire_input(consumer, driver),
                None => self.disconnect_input(consumer),
            }
        }
    }

    fn check_and_adopt_type(&mut self, input: NodePort, output: NodePort) -> Result<()> {
        let out_ty = self.output_type(output);
        let mismatch = |expected: ConnectionType, this: &Self| DesignError::TypeMismatch {
            from: output.node,
            to: input.node,
            from_type: this.output_type(output).to_string(),
            to_type: expected.to_string(),
        };

        let kind = self.node(input.node).kind.clone();
        match &kind {
            NodeKind::Signal
            | NodeKind::ExportOverride
            | NodeKind::Attributes { .. }
            | NodeKind::Pin { .. } => {
                self.node_mut(input.node).output_mut_or_noop(0, out_ty);
            }
            NodeKind::Logic(_) | NodeKind::Arithmetic(_) => {
                let other = self.other_operand(input);
                if let Some(other_ty) = other {
                    if !other_ty.compatible(out_ty) {
                        return Err(mismatch(other_ty, self));
                    }
                }
                self.node_mut(input.node).output_mut_or_noop(0, out_ty);
            }
            NodeKind::Compare(_) => {
                if let Some(other_ty) = self.other_operand(input) {
                    if !other_ty.compatible(out_ty) {
                        return Err(mismatch(other_ty, self));
                    }
                }
            }
            NodeKind::Multiplexer { .. } => {
                if input.port > 0 {
                    self.node_mut(input.node).output_mut_or_noop(0, out_ty);
                }
            }
            NodeKind::PriorityConditional { branches } => {
                let branches = *branches;
                let is_condition = input.port < 2 * branches && input.port % 2 == 0;
                if is_condition {
                    if !out_ty.compatible(ConnectionType::Bool) {
                        return Err(mismatch(ConnectionType::Bool, self));
                    }
                } else {
                    self.node_mut(input.node).output_mut_or_noop(0, out_ty);
                }
            }
            NodeKind::Register { .. } => match input.port {
                REG_DATA | REG_RESET_VALUE => {
                    self.node_mut(input.node).output_mut_or_noop(0, out_ty);
                }
                REG_ENABLE => {
                    if !out_ty.compatible(ConnectionType::Bool) {
                        return Err(mismatch(ConnectionType::Bool, self));
                    }
                }
                _ => {}
            },
            NodeKind::Rewire { .. } => {
                self.update_rewire_type(input.node);
            }
            NodeKind::SignalTap { .. } => {
                if !out_ty.compatible(ConnectionType::Bool) {
                    return Err(mismatch(ConnectionType::Bool, self));
                }
            }
            NodeKind::MemPort(desc) => {
                let desc = *desc;
                match input.port {
                    MEMPORT_MEMORY => {
                        if !out_ty.is_dependency() {
                            return Err(mismatch(ConnectionType::Dependency, self));
                        }
                    }
                    MEMPORT_ENABLE => {
                        if !out_ty.compatible(ConnectionType::Bool) {
                            return Err(mismatch(ConnectionType::Bool, self));
                        }
                    }
                    MEMPORT_WRDATA => {
                        let expected = ConnectionType::BitVec(desc.word_width);
                        if !out_ty.compatible(expected) {
                            return Err(mismatch(expected, self));
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn other_operand(&self, input: NodePort) -> Option<ConnectionType> {
        let node = self.node(input.node);
        if node.num_input_ports() < 2 {
            return None;
        }
        let other_port = 1 - input.port;
        node.driver(other_port).map(|d| self.output_type(d))
    }

    /// Recomputes a rewire's output width from its operation and refreshes
    /// its constant-ness.
    pub fn update_rewire_type(&mut self, node: NodeId) {
        let width = match &self.node(node).kind {
            NodeKind::Rewire { op, .. } => op.total_width(),
            _ => return,
        };
        self.node_mut(node).output_mut(0).ty = ConnectionType::BitVec(width);
        self.refresh_output_kind(node);
    }

    pub fn set_rewire_op(&mut self, node: NodeId, op: RewireOp) {
        match &mut self.node_mut(node).kind {
            NodeKind::Rewire { op: slot, .. } => *slot = op,
            _ => panic!("set_rewire_op on a non-rewire node"),
        }
        self.update_rewire_type(node);
    }

    /// A rewire output is constant when every range is a constant fill or
    /// selects from a constant-kind driver.
    fn refresh_output_kind(&mut self, node_id: NodeId) {
        let node = self.node(node_id);
        let NodeKind::Rewire { op, .. } = &node.kind else { return };
        let mut constant = !op.ranges.is_empty();
        for range in &op.ranges {
            let ok = match range.source {
                RangeSource::Input { index, .. } => node
                    .driver(index)
                    .is_some_and(|d| self.output_kind(d) == OutputKind::Constant),
                _ => true,
            };
            if !ok {
                constant = false;
                break;
            }
        }
        let kind = if constant { OutputKind::Constant } else { OutputKind::Immediate };
        self.node_mut(node_id).output_mut(0).kind = kind;
    }

    // --- clocks ----------------------------------------------------------

    pub fn create_root_clock(
        &mut self,
        name: impl Into<String>,
        frequency: crate::rational::ClockRational,
    ) -> ClockId {
        let id = ClockId(self.clocks.len());
        self.clocks.push(Clock::new_root(id, name, frequency));
        id
    }

    pub fn create_derived_clock(
        &mut self,
        parent: ClockId,
        multiplier: crate::rational::ClockRational,
    ) -> ClockId {
        let id = ClockId(self.clocks.len());
        let clock = Clock::new_derived(id, &self.clocks[parent.0], multiplier);
        self.clocks.push(clock);
        id
    }

    pub fn clock(&self, id: ClockId) -> &Clock {
        &self.clocks[id.0]
    }

    pub fn clock_mut(&mut self, id: ClockId) -> &mut Clock {
        &mut self.clocks[id.0]
    }

    pub fn clocks(&self) -> impl Iterator<Item = &Clock> {
        self.clocks.iter()
    }

    pub fn clock_count(&self) -> usize {
        self.clocks.len()
    }

    pub fn attach_clock(&mut self, node: NodeId, clock_port: usize, clock: ClockId) {
        self.node_mut(node).clocks[clock_port] = Some(clock);
    }

    // --- groups ----------------------------------------------------------

    pub fn root_group(&self) -> GroupId {
        GroupId(0)
    }

    pub fn group(&self, id: GroupId) -> &NodeGroup {
        &self.groups[id.0]
    }

    pub fn group_mut(&mut self, id: GroupId) -> &mut NodeGroup {
        &mut self.groups[id.0]
    }

    pub fn groups(&self) -> impl Iterator<Item = &NodeGroup> {
        self.groups.iter()
    }

    pub fn add_child_group(&mut self, parent: GroupId, group_type: GroupType) -> GroupId {
        let id = GroupId(self.groups.len());
        self.groups.push(NodeGroup::new(id, Some(parent), group_type));
        self.groups[parent.0].children.push(id);
        id
    }

    pub fn move_to_group(&mut self, node: NodeId, group: GroupId) {
        self.node_mut(node).group = Some(group);
    }

    /// Nodes currently placed in a group, ascending by id.
    pub fn nodes_in_group(&self, group: GroupId) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.group == Some(group))
            .map(|n| n.id)
            .collect()
    }

    /// Walks the group tree assigning instance names: the group name,
    /// suffixed with a counter where siblings collide.
    pub fn recur_infer_instance_names(&mut self) {
        let ids: Vec<GroupId> = self.groups.iter().map(|g| g.id).collect();
        for id in ids {
            let children = self.groups[id.0].children.clone();
            let mut seen: HashMap<String, usize> = HashMap::default();
            for child in children {
                let name = if self.groups[child.0].name.is_empty() {
                    "unnamed".to_string()
                } else {
                    self.groups[child.0].name.clone()
                };
                let count = seen.entry(name.clone()).or_insert(0);
                *count += 1;
                self.groups[child.0].instance_name = if *count == 1 {
                    name
                } else {
                    format!("{}_{}", name, count)
                };
            }
        }
    }

    /// Export precondition: every connected register reset value must reach
    /// a constant node through signal identities only. Exporters call this
    /// before emitting.
    pub fn check_export_invariants(&self) -> Result<()> {
        for node in self.nodes() {
            if !matches!(node.kind, NodeKind::Register { .. }) {
                continue;
            }
            let input = NodePort::new(node.id, REG_RESET_VALUE);
            if self.driver(input).is_none() {
                continue;
            }
            let resolved = self.non_signal_driver(input);
            let constant = resolved
                .is_some_and(|d| matches!(self.node(d.node).kind, NodeKind::Constant { .. }));
            if !constant {
                return Err(DesignError::ResetValueNotConstant { register: node.id });
            }
        }
        Ok(())
    }

    // --- structure helpers ----------------------------------------------

    /// Inserts a signal node behind `port` and returns the signal's output
    /// so callers can keep extending the wire.
    pub fn append_signal(&mut self, port: &mut NodePort) -> NodeId {
        let signal = self.create_node(NodeKind::Signal);
        let group = self.node(port.node).group;
        if let Some(group) = group {
            self.move_to_group(signal, group);
        }
        self.connect_input(NodePort::new(signal, 0), *port)
            .expect("signal nodes accept any type");
        *port = NodePort::new(signal, 0);
        signal
    }

    /// Copies the sub-DAG of `source` needed to drive `subnet_outputs`,
    /// stopping at `subnet_inputs` (input ports whose drivers are not
    /// copied). Referenced clocks are recreated lazily. New ids are
    /// assigned in ascending source-id order so copies are deterministic.
    pub fn copy_subnet_from(
        &mut self,
        source: &Circuit,
        subnet_inputs: &[NodePort],
        subnet_outputs: &[NodePort],
    ) -> HashMap<NodeId, NodeId> {
        let input_set: crate::HashSet<NodePort> = subnet_inputs.iter().copied().collect();

        let mut found: Vec<NodeId> = Vec::new();
        let mut seen: crate::HashSet<NodeId> = crate::HashSet::default();
        let mut open: Vec<NodeId> = subnet_outputs.iter().map(|np| np.node).collect();
        while let Some(id) = open.pop() {
            if !seen.insert(id) {
                continue;
            }
            found.push(id);
            let node = source.node(id);
            for port in 0..node.num_input_ports() {
                if input_set.contains(&NodePort::new(id, port)) {
                    continue;
                }
                if let Some(driver) = node.driver(port) {
                    open.push(driver.node);
                }
            }
        }
        found.sort();

        let mut map: HashMap<NodeId, NodeId> = HashMap::default();
        for old_id in &found {
            let new_id = NodeId(self.nodes.len() as u64);
            let mut clone = source.node(*old_id).clone_unconnected(new_id);
            clone.group = Some(self.root_group());
            self.nodes.push(Some(clone));
            map.insert(*old_id, new_id);
        }

        let mut clock_map: HashMap<ClockId, ClockId> = HashMap::default();
        for old_id in &found {
            let new_id = map[old_id];
            let old_node = source.node(*old_id);
            for port in 0..old_node.num_input_ports() {
                let Some(driver) = old_node.driver(port) else { continue };
                if let Some(new_driver) = map.get(&driver.node) {
                    self.rewire_input(
                        NodePort::new(new_id, port),
                        NodePort::new(*new_driver, driver.port),
                    );
                }
            }
            for clock_port in 0..old_node.clocks.len() {
                if let Some(old_clock) = old_node.clocks[clock_port] {
                    let new_clock = self.lazy_clone_clock(source, old_clock, &mut clock_map);
                    self.attach_clock(new_id, clock_port, new_clock);
                }
            }
        }
        map
    }

    fn lazy_clone_clock(
        &mut self,
        source: &Circuit,
        old: ClockId,
        clock_map: &mut HashMap<ClockId, ClockId>,
    ) -> ClockId {
        if let Some(new) = clock_map.get(&old) {
            return *new;
        }
        let old_clock = source.clock(old);
        let new_id = ClockId(self.clocks.len());
        let mut clone = old_clock.clone();
        clone.id = new_id;
        if let Some(parent) = old_clock.parent() {
            let new_parent = self.lazy_clone_clock(source, parent, clock_map);
            clone.kind = match &old_clock.kind {
                crate::clock::ClockKind::Derived { multiplier, .. } => {
                    crate::clock::ClockKind::Derived { parent: new_parent, multiplier: *multiplier }
                }
                root => root.clone(),
            };
        }
        self.clocks.push(clone);
        clock_map.insert(old, new_id);
        new_id
    }

    // --- convenience constructors ---------------------------------------

    pub fn add_constant(&mut self, value: crate::state::BitVecState, ty: ConnectionType) -> NodeId {
        debug_assert_eq!(value.size(), ty.width());
        self.create_node(NodeKind::Constant { value, ty })
    }

    pub fn add_signal(&mut self) -> NodeId {
        self.create_node(NodeKind::Signal)
    }

    pub fn add_logic(&mut self, op: crate::node::LogicOp) -> NodeId {
        self.create_node(NodeKind::Logic(op))
    }

    pub fn add_arithmetic(&mut self, op: crate::node::ArithOp) -> NodeId {
        self.create_node(NodeKind::Arithmetic(op))
    }

    pub fn add_compare(&mut self, op: crate::node::CompareOp) -> NodeId {
        self.create_node(NodeKind::Compare(op))
    }

    pub fn add_mux(&mut self, data_inputs: usize) -> NodeId {
        self.create_node(NodeKind::Multiplexer { data_inputs })
    }

    pub fn add_rewire(&mut self, num_inputs: usize) -> NodeId {
        self.create_node(NodeKind::Rewire { num_inputs, op: RewireOp::default() })
    }

    pub fn add_register(&mut self, clock: ClockId) -> NodeId {
        let id = self.create_node(NodeKind::Register { flags: Default::default() });
        self.attach_clock(id, 0, clock);
        id
    }

    pub fn add_memory(&mut self, desc: crate::node::MemoryDesc) -> NodeId {
        self.create_node(NodeKind::Memory(desc))
    }

    pub fn add_mem_port(&mut self, memory: NodeId, desc: MemPortDesc) -> NodeId {
        let id = self.create_node(NodeKind::MemPort(desc));
        self.connect_input(NodePort::new(id, MEMPORT_MEMORY), NodePort::new(memory, 0))
            .expect("memory output is a dependency");
        id
    }

    pub fn add_pin(&mut self, direction: crate::node::PinDirection) -> NodeId {
        self.create_node(NodeKind::Pin { direction })
    }
}

impl Node {
    fn output_mut_or_noop(&mut self, port: usize, ty: ConnectionType) {
        if !ty.is_dependency() && self.num_output_ports() > port {
            self.outputs[port].ty = ty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LogicOp;
    use crate::state::{bit_state, value_state};

    #[test]
    fn connect_tracks_both_directions() {
        let mut c = Circuit::new();
        let a = c.add_constant(value_state(5, 4), ConnectionType::BitVec(4));
        let s = c.add_signal();
        c.connect_input(NodePort::new(s, 0), NodePort::new(a, 0)).unwrap();

        assert_eq!(c.driver(NodePort::new(s, 0)), Some(NodePort::new(a, 0)));
        assert_eq!(c.node(a).consumers(0), &[NodePort::new(s, 0)]);
        assert_eq!(c.output_type(NodePort::new(s, 0)), ConnectionType::BitVec(4));

        c.disconnect_input(NodePort::new(s, 0));
        assert!(c.node(a).consumers(0).is_empty());
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let mut c = Circuit::new();
        let a = c.add_constant(value_state(1, 4), ConnectionType::BitVec(4));
        let b = c.add_constant(value_state(1, 3), ConnectionType::BitVec(3));
        let and = c.add_logic(LogicOp::And);
        c.connect_input(NodePort::new(and, 0), NodePort::new(a, 0)).unwrap();
        let err = c.connect_input(NodePort::new(and, 1), NodePort::new(b, 0));
        assert!(err.is_err());
    }

    #[test]
    fn bypass_redirects_consumers() {
        let mut c = Circuit::new();
        let a = c.add_constant(bit_state(true), ConnectionType::Bool);
        let s = c.add_signal();
        let t = c.add_signal();
        c.connect_input(NodePort::new(s, 0), NodePort::new(a, 0)).unwrap();
        c.connect_input(NodePort::new(t, 0), NodePort::new(s, 0)).unwrap();

        c.bypass_output_to_input(s, 0, 0);
        assert_eq!(c.driver(NodePort::new(t, 0)), Some(NodePort::new(a, 0)));
        assert!(c.node(s).consumers(0).is_empty());
    }

    #[test]
    fn copy_subnet_renumbers_in_source_order() {
        let mut src = Circuit::new();
        let a = src.add_constant(value_state(3, 4), ConnectionType::BitVec(4));
        let b = src.add_constant(value_state(1, 4), ConnectionType::BitVec(4));
        let add = src.add_arithmetic(crate::node::ArithOp::Add);
        src.connect_input(NodePort::new(add, 0), NodePort::new(a, 0)).unwrap();
        src.connect_input(NodePort::new(add, 1), NodePort::new(b, 0)).unwrap();

        let mut dst = Circuit::new();
        let map = dst.copy_subnet_from(&src, &[], &[NodePort::new(add, 0)]);
        assert_eq!(map.len(), 3);
        let new_add = map[&add];
        assert_eq!(
            dst.driver(NodePort::new(new_add, 0)),
            Some(NodePort::new(map[&a], 0))
        );
        // Ascending source ids map to ascending destination ids.
        assert!(map[&a] < map[&b]);
        assert!(map[&b] < map[&add]);
    }
}
