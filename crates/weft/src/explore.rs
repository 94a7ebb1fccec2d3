use bit_set::BitSet;

use crate::circuit::Circuit;
use crate::node::{NodeId, NodePort};

/// One visited node during an exploration: the node plus the port through
/// which it was entered (an input port going forward, an output port going
/// backward).
#[derive(Debug, Clone, Copy)]
pub struct ExploreHandle {
    pub node: NodeId,
    pub port: usize,
}

/// Depth-first walk over the graph, forward (outputs to consumers) or
/// backward (inputs to drivers). After a handle is returned, the walk
/// continues through that node unless [`Exploration::backtrack`] is called
/// before the next step.
pub struct Exploration<'a> {
    circuit: &'a Circuit,
    forward: bool,
    skip_dependencies: bool,
    skip_signals: bool,
    stack: Vec<NodePort>,
    visited: BitSet,
    pending: Option<NodeId>,
}

impl<'a> Exploration<'a> {
    fn new(circuit: &'a Circuit, forward: bool, stack: Vec<NodePort>) -> Self {
        Self {
            circuit,
            forward,
            skip_dependencies: false,
            skip_signals: false,
            stack,
            visited: BitSet::default(),
            pending: None,
        }
    }

    /// Do not cross zero-width ordering edges.
    pub fn skip_dependencies(mut self) -> Self {
        self.skip_dependencies = true;
        self
    }

    /// Pass through signal identity nodes without yielding them.
    pub fn skip_signals(mut self) -> Self {
        self.skip_signals = true;
        self
    }

    /// Advances to the next node. Call [`Exploration::backtrack`] to stop
    /// descending past the node just returned.
    pub fn next_node(&mut self) -> Option<ExploreHandle> {
        if let Some(node) = self.pending.take() {
            self.expand(node);
        }
        while let Some(np) = self.stack.pop() {
            if !self.visited.insert(np.node.index()) {
                continue;
            }
            if self.skip_signals && self.circuit.node(np.node).is_signal() {
                self.expand(np.node);
                continue;
            }
            self.pending = Some(np.node);
            return Some(ExploreHandle { node: np.node, port: np.port });
        }
        None
    }

    /// Drops the continuations of the most recently returned node.
    pub fn backtrack(&mut self) {
        self.pending = None;
    }

    fn expand(&mut self, node: NodeId) {
        let node = self.circuit.node(node);
        if self.forward {
            for port in 0..node.num_output_ports() {
                if self.skip_dependencies && node.output(port).ty.is_dependency() {
                    continue;
                }
                for consumer in node.consumers(port) {
                    self.stack.push(*consumer);
                }
            }
        } else {
            for port in 0..node.num_input_ports() {
                let Some(driver) = node.driver(port) else { continue };
                if self.skip_dependencies
                    && self.circuit.output_type(driver).is_dependency()
                {
                    continue;
                }
                self.stack.push(driver);
            }
        }
    }
}

impl Circuit {
    /// Walks forward from an output port over everything it drives.
    pub fn explore_output(&self, output: NodePort) -> Exploration<'_> {
        let stack = self.node(output.node).consumers(output.port).to_vec();
        Exploration::new(self, true, stack)
    }

    /// Walks backward from an input port over everything driving it.
    pub fn explore_input(&self, input: NodePort) -> Exploration<'_> {
        let stack = self.driver(input).map(|d| vec![d]).unwrap_or_default();
        Exploration::new(self, false, stack)
    }

    /// Whether the signal path forks at this node: more than one consumed
    /// output, or any output with several consumers.
    pub fn is_branching_forward(&self, node: NodeId) -> bool {
        let node = self.node(node);
        let mut consumed_outputs = 0;
        for port in 0..node.num_output_ports() {
            let consumers = node.consumers(port).len();
            if consumers > 1 {
                return true;
            }
            if consumers == 1 {
                consumed_outputs += 1;
            }
        }
        consumed_outputs > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ConnectionType, LogicOp};
    use crate::state::bit_state;

    #[test]
    fn forward_walk_with_backtrack() {
        let mut c = Circuit::new();
        let a = c.add_constant(bit_state(true), ConnectionType::Bool);
        let s = c.add_signal();
        let not = c.add_logic(LogicOp::Not);
        let t = c.add_signal();
        c.connect_input(NodePort::new(s, 0), NodePort::new(a, 0)).unwrap();
        c.connect_input(NodePort::new(not, 0), NodePort::new(s, 0)).unwrap();
        c.connect_input(NodePort::new(t, 0), NodePort::new(not, 0)).unwrap();

        // Unrestricted walk reaches everything downstream.
        let mut seen = Vec::new();
        let mut walk = c.explore_output(NodePort::new(a, 0));
        while let Some(h) = walk.next_node() {
            seen.push(h.node);
        }
        assert_eq!(seen, vec![s, not, t]);

        // Backtracking at the NOT stops before the trailing signal.
        let mut seen = Vec::new();
        let mut walk = c.explore_output(NodePort::new(a, 0));
        while let Some(h) = walk.next_node() {
            seen.push(h.node);
            if !c.node(h.node).is_signal() {
                walk.backtrack();
            }
        }
        assert_eq!(seen, vec![s, not]);

        // Signal-skipping walk yields only the NOT.
        let mut seen = Vec::new();
        let mut walk = c.explore_output(NodePort::new(a, 0)).skip_signals();
        while let Some(h) = walk.next_node() {
            seen.push(h.node);
        }
        assert_eq!(seen, vec![not]);
    }

    #[test]
    fn branching_detection() {
        let mut c = Circuit::new();
        let a = c.add_constant(bit_state(true), ConnectionType::Bool);
        let s1 = c.add_signal();
        let s2 = c.add_signal();
        c.connect_input(NodePort::new(s1, 0), NodePort::new(a, 0)).unwrap();
        assert!(!c.is_branching_forward(a));
        c.connect_input(NodePort::new(s2, 0), NodePort::new(a, 0)).unwrap();
        assert!(c.is_branching_forward(a));
    }
}
