use bit_set::BitSet;

use crate::circuit::Circuit;
use crate::node::{NodeId, NodeKind, NodePort, TapLevel, EXPORT_EXPORT, EXPORT_SIM};

/// A set of nodes of one circuit with set algebra and topology-aware
/// constructors. Backed by a bit set over node ids, so iteration is always
/// in ascending id order.
#[derive(Debug, Clone, Default)]
pub struct Subnet {
    nodes: BitSet,
}

impl Subnet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: NodeId) -> &mut Self {
        self.nodes.insert(node.index());
        self
    }

    pub fn remove(&mut self, node: NodeId) -> &mut Self {
        self.nodes.remove(node.index());
        self
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(node.index())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.count()
    }

    pub fn union_with(&mut self, other: &Subnet) {
        self.nodes.union_with(&other.nodes);
    }

    /// Ascending node-id iteration.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|i| NodeId(i as u64))
    }

    // --- constructors ----------------------------------------------------

    pub fn all(circuit: &Circuit) -> Self {
        let mut res = Self::new();
        for node in circuit.nodes() {
            res.insert(node.id);
        }
        res
    }

    /// Everything a simulation needs: nodes with side effects or frontend
    /// references (or the given outputs), transitively back through their
    /// drivers. Export overrides contribute only their simulation side and
    /// are themselves excluded (their output aliases the driver).
    pub fn all_for_simulation(circuit: &Circuit, outputs: &[NodePort]) -> Self {
        let mut res = Self::new();
        let mut open: Vec<NodeId> = Vec::new();
        if outputs.is_empty() {
            for node in circuit.nodes() {
                if node.has_side_effects() || node.has_ref() {
                    open.push(node.id);
                }
            }
        } else {
            open.extend(outputs.iter().map(|np| np.node));
        }

        let mut handled = BitSet::<u32>::default();
        while let Some(id) = open.pop() {
            if !handled.insert(id.index()) {
                continue;
            }
            let node = circuit.node(id);
            if matches!(node.kind, NodeKind::ExportOverride) {
                if let Some(driver) = node.driver(EXPORT_SIM) {
                    open.push(driver.node);
                }
                continue;
            }
            res.insert(id);
            for port in 0..node.num_input_ports() {
                if let Some(driver) = node.driver(port) {
                    open.push(driver.node);
                }
            }
        }
        res
    }

    /// Mirror of [`Subnet::all_for_simulation`] for the exporter: follows
    /// the export side of export overrides, and keeps signal taps only when
    /// they assert or warn and asserts were requested.
    pub fn all_for_export(circuit: &Circuit, include_asserts: bool) -> Self {
        let mut open: Vec<NodeId> = Vec::new();
        for node in circuit.nodes() {
            if !node.has_side_effects() {
                continue;
            }
            if let NodeKind::SignalTap { level, .. } = &node.kind {
                let wanted = matches!(level, TapLevel::Assert | TapLevel::Warn);
                if !wanted || !include_asserts {
                    continue;
                }
            }
            open.push(node.id);
        }

        let mut handled = BitSet::<u32>::default();
        while let Some(id) = open.pop() {
            if !handled.insert(id.index()) {
                continue;
            }
            let node = circuit.node(id);
            if matches!(node.kind, NodeKind::ExportOverride) {
                if let Some(driver) = node.driver(EXPORT_EXPORT) {
                    open.push(driver.node);
                }
                continue;
            }
            for port in 0..node.num_input_ports() {
                if let Some(driver) = node.driver(port) {
                    open.push(driver.node);
                }
            }
        }

        let mut res = Self::new();
        for idx in handled.iter() {
            res.nodes.insert(idx);
        }
        res
    }

    /// Everything driven directly or indirectly by the given outputs,
    /// stopping at the limiting input ports.
    pub fn all_driven_by(
        circuit: &Circuit,
        outputs: &[NodePort],
        limiting_inputs: &[NodePort],
    ) -> Self {
        let limits: crate::HashSet<NodePort> = limiting_inputs.iter().copied().collect();
        let mut res = Self::new();
        let mut open: Vec<NodePort> = Vec::new();
        for output in outputs {
            for consumer in circuit.node(output.node).consumers(output.port) {
                open.push(*consumer);
            }
        }
        let mut seen: crate::HashSet<NodePort> = crate::HashSet::default();
        while let Some(input) = open.pop() {
            if limits.contains(&input) || !seen.insert(input) {
                continue;
            }
            res.insert(input.node);
            let node = circuit.node(input.node);
            for port in 0..node.num_output_ports() {
                for consumer in node.consumers(port) {
                    open.push(*consumer);
                }
            }
        }
        res
    }

    /// Backward closure from side-effecting or referenced nodes.
    pub fn all_used_nodes(circuit: &Circuit) -> Self {
        let mut res = Self::new();
        let mut open: Vec<NodeId> = circuit
            .nodes()
            .filter(|n| n.has_side_effects() || n.has_ref())
            .map(|n| n.id)
            .collect();
        while let Some(id) = open.pop() {
            if res.contains(id) {
                continue;
            }
            res.insert(id);
            let node = circuit.node(id);
            for port in 0..node.num_input_ports() {
                if let Some(driver) = node.driver(port) {
                    open.push(driver.node);
                }
            }
        }
        res
    }

    /// Everything driving the given inputs, stopping at limiting outputs.
    pub fn all_necessary_for_inputs(
        circuit: &Circuit,
        limiting_outputs: &[NodePort],
        inputs: &[NodePort],
    ) -> Self {
        let mut res = Self::new();
        let mut found = BitSet::<u32>::default();
        for np in limiting_outputs {
            found.insert(np.node.index());
        }
        let mut open: Vec<NodeId> = inputs
            .iter()
            .filter_map(|np| circuit.driver(*np))
            .map(|d| d.node)
            .collect();
        while let Some(id) = open.pop() {
            if !found.insert(id.index()) {
                continue;
            }
            res.insert(id);
            let node = circuit.node(id);
            for port in 0..node.num_input_ports() {
                if let Some(driver) = node.driver(port) {
                    open.push(driver.node);
                }
            }
        }
        res
    }

    /// Everything driving the given nodes, stopping at limiting nodes.
    pub fn all_necessary_for_nodes(
        circuit: &Circuit,
        limiting_nodes: &[NodeId],
        nodes: &[NodeId],
    ) -> Self {
        let mut res = Self::new();
        let mut found = BitSet::<u32>::default();
        for id in limiting_nodes {
            found.insert(id.index());
        }
        let mut open: Vec<NodeId> = nodes.to_vec();
        while let Some(id) = open.pop() {
            if !found.insert(id.index()) {
                continue;
            }
            res.insert(id);
            let node = circuit.node(id);
            for port in 0..node.num_input_ports() {
                if let Some(driver) = node.driver(port) {
                    open.push(driver.node);
                }
            }
        }
        res
    }

    /// The combinational cone driven by the given outputs; stops at
    /// non-combinational nodes (which are not included).
    pub fn all_driven_combinationally_by(circuit: &Circuit, outputs: &[NodePort]) -> Self {
        let mut res = Self::new();
        let mut seen = BitSet::<u32>::default();
        let mut open: Vec<NodeId> = Vec::new();
        for np in outputs {
            for consumer in circuit.node(np.node).consumers(np.port) {
                open.push(consumer.node);
            }
        }
        while let Some(id) = open.pop() {
            if !seen.insert(id.index()) {
                continue;
            }
            let node = circuit.node(id);
            if !node.is_combinational() {
                continue;
            }
            res.insert(id);
            for port in 0..node.num_output_ports() {
                for consumer in node.consumers(port) {
                    open.push(consumer.node);
                }
            }
        }
        res
    }

    pub fn from_node_group(circuit: &Circuit, group: crate::group::GroupId, recursive: bool) -> Self {
        let mut res = Self::new();
        let mut groups = vec![group];
        while let Some(g) = groups.pop() {
            for node in circuit.nodes() {
                if node.group == Some(g) {
                    res.insert(node.id);
                }
            }
            if recursive {
                groups.extend(circuit.group(g).children.iter().copied());
            }
        }
        res
    }

    // --- operations ------------------------------------------------------

    /// Grows the set by one hop along consumer (forward) and/or driver
    /// (backward) edges.
    pub fn dilate(&mut self, circuit: &Circuit, forward: bool, backward: bool) {
        let mut new_nodes: Vec<NodeId> = Vec::new();
        for id in self.iter() {
            let node = circuit.node(id);
            if backward {
                for port in 0..node.num_input_ports() {
                    if let Some(driver) = node.driver(port) {
                        if !self.contains(driver.node) {
                            new_nodes.push(driver.node);
                        }
                    }
                }
            }
            if forward {
                for port in 0..node.num_output_ports() {
                    for consumer in node.consumers(port) {
                        if !self.contains(consumer.node) {
                            new_nodes.push(consumer.node);
                        }
                    }
                }
            }
        }
        for id in new_nodes {
            self.insert(id);
        }
    }

    /// Retains only nodes that lie on a directed cycle within the set, by
    /// repeatedly peeling nodes without an in-set predecessor or successor.
    #[must_use]
    pub fn filter_loop_nodes_only(&self, circuit: &Circuit) -> Subnet {
        let mut res = self.clone();
        loop {
            let mut removed = false;
            let current: Vec<NodeId> = res.iter().collect();
            for id in current {
                let node = circuit.node(id);
                let has_pred = (0..node.num_input_ports())
                    .filter_map(|p| node.driver(p))
                    .any(|d| res.contains(d.node));
                let has_succ = (0..node.num_output_ports())
                    .flat_map(|p| node.consumers(p).iter())
                    .any(|c| res.contains(c.node));
                if !has_pred || !has_succ {
                    res.remove(id);
                    removed = true;
                }
            }
            if !removed {
                return res;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LogicOp;
    use crate::state::bit_state;

    #[test]
    fn driven_by_stops_at_limiting_inputs() {
        let mut c = Circuit::new();
        let a = c.add_constant(bit_state(true), crate::node::ConnectionType::Bool);
        let not1 = c.add_logic(LogicOp::Not);
        let not2 = c.add_logic(LogicOp::Not);
        c.connect_input(NodePort::new(not1, 0), NodePort::new(a, 0)).unwrap();
        c.connect_input(NodePort::new(not2, 0), NodePort::new(not1, 0)).unwrap();

        let driven = Subnet::all_driven_by(&c, &[NodePort::new(a, 0)], &[NodePort::new(not2, 0)]);
        assert!(driven.contains(not1));
        assert!(!driven.contains(not2));

        let unbounded = Subnet::all_driven_by(&c, &[NodePort::new(a, 0)], &[]);
        assert!(unbounded.contains(not1));
        assert!(unbounded.contains(not2));
    }

    #[test]
    fn loop_filter_keeps_only_cycles() {
        let mut c = Circuit::new();
        let a = c.add_constant(bit_state(true), crate::node::ConnectionType::Bool);
        let and = c.add_logic(LogicOp::And);
        let not = c.add_logic(LogicOp::Not);
        c.connect_input(NodePort::new(and, 0), NodePort::new(a, 0)).unwrap();
        c.connect_input(NodePort::new(and, 1), NodePort::new(not, 0)).unwrap();
        c.connect_input(NodePort::new(not, 0), NodePort::new(and, 0)).unwrap();

        let loops = Subnet::all(&c).filter_loop_nodes_only(&c);
        assert!(loops.contains(and));
        assert!(loops.contains(not));
        assert!(!loops.contains(a));
    }
}
