use itertools::Itertools;

use crate::HashMap;
use crate::circuit::Circuit;
use crate::group::GroupId;
use crate::node::{CompareOp, ConnectionType, LogicOp, NodeKind, NodePort};
use crate::state::{bit_state, Plane};

/// One literal of a conjunction.
#[derive(Debug, Clone, Copy)]
pub struct Term {
    /// Canonical signal the literal tests.
    pub driver: NodePort,
    pub negated: bool,
    /// Driver to wire against when re-emitting, which may be a signal node
    /// closer to the consumption site than the canonical driver.
    pub conjunction_driver: NodePort,
}

/// Normalized AND-of-possibly-negated-literals form of a boolean sub-DAG.
/// Built by descending through AND, NOT, and signal nodes while folding
/// constants; underpins the multiplexer rewrites.
#[derive(Debug, Clone, Default)]
pub struct Conjunction {
    terms: HashMap<NodePort, Term>,
    undefined: bool,
    contradicting: bool,
}

struct TraceInfo {
    signal: Option<NodePort>,
    negated: bool,
    can_descend_into_and: bool,
    last_logic_driver: Option<NodePort>,
}

impl Conjunction {
    pub fn parse_input(circuit: &Circuit, input: NodePort) -> Self {
        Self::parse_output(circuit, circuit.driver(input))
    }

    pub fn parse_output(circuit: &Circuit, output: Option<NodePort>) -> Self {
        let mut res = Self::default();

        let mut stack = vec![TraceInfo {
            signal: output,
            negated: false,
            can_descend_into_and: true,
            last_logic_driver: output,
        }];

        let mut visited: HashMap<NodePort, bool> = HashMap::default();
        while let Some(top) = stack.pop() {
            let Some(signal) = top.signal else {
                res.undefined = true;
                continue;
            };
            if let Some(&negated) = visited.get(&signal) {
                if negated != top.negated {
                    res.contradicting = true;
                }
                continue;
            }
            visited.insert(signal, top.negated);

            let node = circuit.node(signal.node);
            let mut add_as_term = true;
            match &node.kind {
                NodeKind::Constant { value, .. } if value.size() == 1 => {
                    if value.get(Plane::Defined, 0) {
                        add_as_term = false;
                        if !(value.get(Plane::Value, 0) ^ top.negated) {
                            // ANDed with constant zero: whole expression false.
                            res.contradicting = true;
                        }
                    }
                }
                NodeKind::Logic(LogicOp::Not) => {
                    let driver = node.driver(0);
                    stack.push(TraceInfo {
                        signal: driver,
                        negated: !top.negated,
                        // ~(a & b) is ~a | ~b, so after a negation the walk
                        // must not break ANDs into separate terms.
                        can_descend_into_and: top.negated,
                        last_logic_driver: driver,
                    });
                    add_as_term = false;
                }
                NodeKind::Logic(LogicOp::And) if top.can_descend_into_and => {
                    for port in 0..node.num_input_ports() {
                        let driver = node.driver(port);
                        stack.push(TraceInfo {
                            signal: driver,
                            negated: top.negated,
                            can_descend_into_and: true,
                            last_logic_driver: driver,
                        });
                    }
                    add_as_term = false;
                }
                NodeKind::Signal => {
                    stack.push(TraceInfo {
                        signal: node.driver(0),
                        negated: top.negated,
                        can_descend_into_and: true,
                        last_logic_driver: top.last_logic_driver,
                    });
                    add_as_term = false;
                }
                _ => {}
            }

            if add_as_term {
                if let Some(existing) = res.terms.get(&signal) {
                    if existing.negated != top.negated {
                        res.contradicting = true;
                    }
                } else {
                    res.terms.insert(
                        signal,
                        Term {
                            driver: signal,
                            negated: top.negated,
                            conjunction_driver: top.last_logic_driver.unwrap_or(signal),
                        },
                    );
                }
            }
        }
        res
    }

    pub fn is_undefined(&self) -> bool {
        self.undefined
    }

    pub fn is_contradicting(&self) -> bool {
        self.contradicting
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn is_equal_to(&self, other: &Conjunction) -> bool {
        if self.undefined || other.undefined {
            return false;
        }
        if self.contradicting || other.contradicting {
            return self.contradicting && other.contradicting;
        }
        if self.terms.len() != other.terms.len() {
            return false;
        }
        self.terms.values().all(|term| {
            other
                .terms
                .get(&term.driver)
                .is_some_and(|o| o.negated == term.negated)
        })
    }

    /// Only single-term conjunctions can be literal negations of each
    /// other; anything larger would require De Morgan expansion.
    pub fn is_negation_of(&self, other: &Conjunction) -> bool {
        if self.undefined || other.undefined {
            return false;
        }
        if self.contradicting {
            return !other.contradicting && other.terms.is_empty();
        }
        if other.contradicting {
            return !self.contradicting && self.terms.is_empty();
        }
        if self.terms.len() != other.terms.len() || self.terms.len() != 1 {
            return false;
        }
        self.terms.values().all(|term| {
            other
                .terms
                .get(&term.driver)
                .is_some_and(|o| o.negated != term.negated)
        })
    }

    pub fn is_subset_of(&self, other: &Conjunction) -> bool {
        if self.undefined || other.undefined {
            return false;
        }
        if self.contradicting || other.contradicting {
            return false;
        }
        self.terms.values().all(|term| {
            other
                .terms
                .get(&term.driver)
                .is_some_and(|o| o.negated == term.negated)
        })
    }

    /// True when the two conjunctions exclude each other: some literal
    /// appears with opposite polarity, or (optionally) both compare the
    /// same signal for equality with different constants.
    pub fn cannot_both_be_true(
        &self,
        circuit: &Circuit,
        other: &Conjunction,
        check_comparisons: bool,
    ) -> bool {
        if self.undefined || other.undefined {
            return false;
        }
        if self.contradicting || other.contradicting {
            return true;
        }
        for term in self.terms.values() {
            if let Some(o) = other.terms.get(&term.driver) {
                if o.negated != term.negated {
                    return true;
                }
            }
        }
        if !check_comparisons {
            return false;
        }
        for term in self.terms.values().filter(|t| !t.negated) {
            for o in other.terms.values().filter(|t| !t.negated) {
                let Some((c1, sig1)) = comparison_with_constant(circuit, term.driver) else {
                    continue;
                };
                let Some((c2, sig2)) = comparison_with_constant(circuit, o.driver) else {
                    continue;
                };
                if sig1 != sig2 {
                    continue;
                }
                let (v1, v2) = (circuit.node(c1.node), circuit.node(c2.node));
                let (NodeKind::Constant { value: v1, .. }, NodeKind::Constant { value: v2, .. }) =
                    (&v1.kind, &v2.kind)
                else {
                    continue;
                };
                if v1.size() == v2.size()
                    && v1.all_defined(0, v1.size())
                    && v2.all_defined(0, v2.size())
                    && v1 != v2
                {
                    return true;
                }
            }
        }
        false
    }

    /// Keeps only literals present (with polarity) in `other`.
    pub fn intersect_terms_with(&mut self, other: &Conjunction) {
        self.terms.retain(|driver, term| {
            other
                .terms
                .get(driver)
                .is_some_and(|o| o.negated == term.negated)
        });
    }

    /// Removes `other`'s literals; `other` must be a subset.
    pub fn remove_terms(&mut self, other: &Conjunction) {
        for (driver, term) in &other.terms {
            let removed = self.terms.remove(driver);
            debug_assert!(
                removed.is_some_and(|r| r.negated == term.negated),
                "remove_terms requires a subset"
            );
        }
    }

    /// Re-emits the conjunction as a minimal NOT/AND chain inside the given
    /// group. Terms are ordered by driver id so reruns produce identical
    /// graphs. An empty conjunction yields a constant one, or nothing when
    /// `allow_unconnected`.
    pub fn build(
        &self,
        circuit: &mut Circuit,
        group: GroupId,
        allow_unconnected: bool,
    ) -> Option<NodePort> {
        debug_assert!(!self.undefined, "cannot build an undefined conjunction");
        debug_assert!(!self.contradicting, "cannot build a contradicting conjunction");

        if self.terms.is_empty() {
            if allow_unconnected {
                return None;
            }
            let one = circuit.add_constant(bit_state(true), ConnectionType::Bool);
            circuit.move_to_group(one, group);
            return Some(NodePort::new(one, 0));
        }

        let sorted = self.terms.values().sorted_by_key(|t| t.driver);

        let mut operands: Vec<NodePort> = Vec::with_capacity(self.terms.len());
        for term in sorted {
            if term.negated {
                let not = circuit.add_logic(LogicOp::Not);
                circuit.move_to_group(not, group);
                circuit
                    .connect_input(NodePort::new(not, 0), term.conjunction_driver)
                    .expect("boolean term");
                operands.push(NodePort::new(not, 0));
            } else {
                operands.push(term.conjunction_driver);
            }
        }

        let mut last = operands[0];
        for operand in &operands[1..] {
            let and = circuit.add_logic(LogicOp::And);
            circuit.move_to_group(and, group);
            circuit.connect_input(NodePort::new(and, 0), last).expect("boolean term");
            circuit.connect_input(NodePort::new(and, 1), *operand).expect("boolean term");
            last = NodePort::new(and, 0);
        }
        Some(last)
    }
}

/// Recognizes `signal == constant` (through signal nodes); returns the
/// constant's port and the non-constant side.
fn comparison_with_constant(circuit: &Circuit, output: NodePort) -> Option<(NodePort, NodePort)> {
    let node = circuit.node(output.node);
    if !matches!(node.kind, NodeKind::Compare(CompareOp::Eq)) {
        return None;
    }
    let a = circuit.non_signal_driver(NodePort::new(output.node, 0))?;
    let b = circuit.non_signal_driver(NodePort::new(output.node, 1))?;
    let a_const = matches!(circuit.node(a.node).kind, NodeKind::Constant { .. });
    let b_const = matches!(circuit.node(b.node).kind, NodeKind::Constant { .. });
    match (a_const, b_const) {
        (true, false) => Some((a, b)),
        (false, true) => Some((b, a)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LogicOp;

    fn bool_input(c: &mut Circuit) -> NodePort {
        let pin = c.add_pin(crate::node::PinDirection::Input);
        c.node_mut(pin).output_mut(0).ty = ConnectionType::Bool;
        NodePort::new(pin, 0)
    }

    #[test]
    fn parses_and_of_negations() {
        let mut c = Circuit::new();
        let a = bool_input(&mut c);
        let b = bool_input(&mut c);
        let not_b = c.add_logic(LogicOp::Not);
        c.connect_input(NodePort::new(not_b, 0), b).unwrap();
        let and = c.add_logic(LogicOp::And);
        c.connect_input(NodePort::new(and, 0), a).unwrap();
        c.connect_input(NodePort::new(and, 1), NodePort::new(not_b, 0)).unwrap();

        let conj = Conjunction::parse_output(&c, Some(NodePort::new(and, 0)));
        assert_eq!(conj.num_terms(), 2);
        assert!(!conj.is_contradicting());
        assert!(!conj.is_undefined());
    }

    #[test]
    fn negation_and_equality() {
        let mut c = Circuit::new();
        let a = bool_input(&mut c);
        let not_a = c.add_logic(LogicOp::Not);
        c.connect_input(NodePort::new(not_a, 0), a).unwrap();

        let plain = Conjunction::parse_output(&c, Some(a));
        let negated = Conjunction::parse_output(&c, Some(NodePort::new(not_a, 0)));
        assert!(plain.is_negation_of(&negated));
        assert!(negated.is_negation_of(&plain));
        assert!(plain.is_equal_to(&plain));
        assert!(!plain.is_equal_to(&negated));
    }

    #[test]
    fn a_and_not_a_contradicts() {
        let mut c = Circuit::new();
        let a = bool_input(&mut c);
        let not_a = c.add_logic(LogicOp::Not);
        c.connect_input(NodePort::new(not_a, 0), a).unwrap();
        let and = c.add_logic(LogicOp::And);
        c.connect_input(NodePort::new(and, 0), a).unwrap();
        c.connect_input(NodePort::new(and, 1), NodePort::new(not_a, 0)).unwrap();

        let conj = Conjunction::parse_output(&c, Some(NodePort::new(and, 0)));
        assert!(conj.is_contradicting());
    }

    #[test]
    fn build_is_deterministic_and_sorted() {
        let mut c = Circuit::new();
        let a = bool_input(&mut c);
        let b = bool_input(&mut c);
        let and = c.add_logic(LogicOp::And);
        c.connect_input(NodePort::new(and, 0), b).unwrap();
        c.connect_input(NodePort::new(and, 1), a).unwrap();

        let conj = Conjunction::parse_output(&c, Some(NodePort::new(and, 0)));
        let root = c.root_group();
        let rebuilt = conj.build(&mut c, root, false).unwrap();
        // The rebuilt AND wires the lower-id term first.
        let first = c.driver(NodePort::new(rebuilt.node, 0)).unwrap();
        let second = c.driver(NodePort::new(rebuilt.node, 1)).unwrap();
        assert_eq!(first, a);
        assert_eq!(second, b);
    }

    #[test]
    fn exclusive_constant_comparisons() {
        let mut c = Circuit::new();
        let sig = {
            let pin = c.add_pin(crate::node::PinDirection::Input);
            c.node_mut(pin).output_mut(0).ty = ConnectionType::BitVec(4);
            NodePort::new(pin, 0)
        };
        let c3 = c.add_constant(crate::state::value_state(3, 4), ConnectionType::BitVec(4));
        let c7 = c.add_constant(crate::state::value_state(7, 4), ConnectionType::BitVec(4));
        let eq3 = c.add_compare(CompareOp::Eq);
        c.connect_input(NodePort::new(eq3, 0), sig).unwrap();
        c.connect_input(NodePort::new(eq3, 1), NodePort::new(c3, 0)).unwrap();
        let eq7 = c.add_compare(CompareOp::Eq);
        c.connect_input(NodePort::new(eq7, 0), sig).unwrap();
        c.connect_input(NodePort::new(eq7, 1), NodePort::new(c7, 0)).unwrap();

        let conj3 = Conjunction::parse_output(&c, Some(NodePort::new(eq3, 0)));
        let conj7 = Conjunction::parse_output(&c, Some(NodePort::new(eq7, 0)));
        assert!(conj3.cannot_both_be_true(&c, &conj7, true));
        assert!(!conj3.cannot_both_be_true(&c, &conj7, false));
    }
}
