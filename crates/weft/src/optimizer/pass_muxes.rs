use log::debug;

use crate::circuit::Circuit;
use crate::conjunction::Conjunction;
use crate::node::{
    LogicOp, NodeId, NodeKind, NodePort, RangeSource, REG_DATA, REG_ENABLE,
};
use crate::state::Plane;

fn two_input_muxes(circuit: &Circuit) -> Vec<NodeId> {
    circuit
        .nodes()
        .filter(|n| matches!(n.kind, NodeKind::Multiplexer { data_inputs: 2 }))
        .map(|n| n.id)
        .collect()
}

/// Collapses chains of two muxes that test the same (or negated)
/// condition: the inner mux can never change the outcome, so the outer
/// branch connects straight to the branch the inner one would pick.
pub fn merge_muxes(circuit: &mut Circuit) {
    loop {
        let mut done = true;
        for mux in two_input_muxes(circuit) {
            if !circuit.contains_node(mux) {
                continue;
            }
            let condition = Conjunction::parse_input(circuit, NodePort::new(mux, 0));

            for branch in 0..2usize {
                let data_port = 1 + branch;
                let Some(inner) = circuit.non_signal_driver(NodePort::new(mux, data_port)) else {
                    continue;
                };
                if inner.node == mux {
                    continue;
                }
                if !matches!(
                    circuit.node(inner.node).kind,
                    NodeKind::Multiplexer { data_inputs: 2 }
                ) {
                    continue;
                }
                let inner_condition = Conjunction::parse_input(circuit, NodePort::new(inner.node, 0));

                let inner_branch = if inner_condition.is_equal_to(&condition) {
                    // The inner mux resolves the same way the outer one did.
                    branch
                } else if condition.is_negation_of(&inner_condition) {
                    1 - branch
                } else {
                    continue;
                };

                let Some(bypass) = circuit.driver(NodePort::new(inner.node, 1 + inner_branch)) else {
                    continue;
                };
                circuit.rewire_input(NodePort::new(mux, data_port), bypass);
                done = false;
            }
        }
        if done {
            return;
        }
    }
}

/// Removes muxes whose output is consumed only by logic that ends in muxes
/// with the same condition selecting the same branch: along such paths the
/// mux never influences the result, so consumers connect to the branch
/// directly.
pub fn remove_irrelevant_muxes(circuit: &mut Circuit) {
    loop {
        let mut done = true;
        for mux in two_input_muxes(circuit) {
            if !circuit.contains_node(mux) {
                continue;
            }
            let condition = Conjunction::parse_input(circuit, NodePort::new(mux, 0));
            let mux_group = circuit.node(mux).group;

            for data_port in 1..3usize {
                let consumers: Vec<NodePort> = circuit.node(mux).consumers(0).to_vec();
                for mux_output in consumers {
                    let mut open = vec![mux_output];
                    let mut closed: crate::HashSet<NodePort> = crate::HashSet::default();
                    let mut all_outputs_muxed = true;

                    while let Some(input) = open.pop() {
                        if !closed.insert(input) {
                            continue;
                        }
                        let node = circuit.node(input.node);
                        if node.has_side_effects() || !node.is_combinational() {
                            all_outputs_muxed = false;
                            break;
                        }
                        if node.group != mux_group {
                            all_outputs_muxed = false;
                            break;
                        }

                        if matches!(node.kind, NodeKind::Multiplexer { data_inputs: 2 }) {
                            let downstream =
                                Conjunction::parse_input(circuit, NodePort::new(input.node, 0));
                            if input.port == data_port && condition.is_equal_to(&downstream) {
                                continue;
                            }
                            if input.port != data_port
                                && input.port != 0
                                && condition.is_negation_of(&downstream)
                            {
                                continue;
                            }
                        }

                        for port in 0..node.num_output_ports() {
                            for driven in node.consumers(port) {
                                open.push(*driven);
                            }
                        }
                    }

                    if all_outputs_muxed {
                        if let Some(replacement) = circuit.driver(NodePort::new(mux, data_port)) {
                            circuit.rewire_input(mux_output, replacement);
                            done = false;
                        }
                    }
                }
            }
        }
        if done {
            return;
        }
    }
}

/// Normalizes `mux(!c, a, b)` into `mux(c, b, a)`, unraveling chains of
/// negations on the selector.
pub fn cull_mux_condition_negations(circuit: &mut Circuit) {
    for mux in two_input_muxes(circuit) {
        loop {
            let Some(selector) = circuit.non_signal_driver(NodePort::new(mux, 0)) else { break };
            if !matches!(circuit.node(selector.node).kind, NodeKind::Logic(LogicOp::Not)) {
                break;
            }
            let Some(inverted) = circuit.driver(NodePort::new(selector.node, 0)) else { break };

            let input0 = circuit.driver(NodePort::new(mux, 1));
            let input1 = circuit.driver(NodePort::new(mux, 2));
            circuit.rewire_input(NodePort::new(mux, 0), inverted);
            match input1 {
                Some(d) => circuit.rewire_input(NodePort::new(mux, 1), d),
                None => circuit.disconnect_input(NodePort::new(mux, 1)),
            }
            match input0 {
                Some(d) => circuit.rewire_input(NodePort::new(mux, 2), d),
                None => circuit.disconnect_input(NodePort::new(mux, 2)),
            }
        }
    }
}

/// Deletes rewire nodes that reproduce their input unchanged. These
/// otherwise hide memory access patterns from block-RAM detection.
pub fn remove_noop_rewires(circuit: &mut Circuit) {
    let mut removed = 0usize;
    for id in circuit.node_ids() {
        if !circuit.contains_node(id) {
            continue;
        }
        let node = circuit.node(id);
        let NodeKind::Rewire { op, .. } = &node.kind else { continue };
        let Some(driver) = node.driver(0) else { continue };
        if node.output(0).ty != circuit.output_type(driver) {
            continue;
        }
        let mut offset = 0usize;
        let mut is_noop = true;
        for range in &op.ranges {
            match range.source {
                RangeSource::Input { index: 0, offset: in_offset } if in_offset == offset => {
                    offset += range.subwidth;
                }
                _ => {
                    is_noop = false;
                    break;
                }
            }
        }
        if !is_noop || offset != circuit.output_type(driver).width() {
            continue;
        }

        circuit.bypass_output_to_input(id, 0, 0);
        if !circuit.node(id).has_ref() {
            circuit.disconnect_input(NodePort::new(id, 0));
            circuit.remove_node(id);
            removed += 1;
        }
    }
    if removed > 0 {
        debug!("removed {} no-op rewires", removed);
    }
}

/// Rewrites `reg(D = mux(c, reg, x))` as `reg(D = x, EN = en & c)`; the
/// feedback branch of the mux is what an enable already expresses.
pub fn fold_register_mux_enable_loops(circuit: &mut Circuit) {
    for reg in circuit.node_ids() {
        if !circuit.contains_node(reg) {
            continue;
        }
        if !matches!(circuit.node(reg).kind, NodeKind::Register { .. }) {
            continue;
        }
        let enable = circuit.driver(NodePort::new(reg, REG_ENABLE));
        let Some(data) = circuit.non_signal_driver(NodePort::new(reg, REG_DATA)) else { continue };
        if !matches!(circuit.node(data.node).kind, NodeKind::Multiplexer { data_inputs: 2 }) {
            continue;
        }
        let mux = data.node;
        let mux_input1 = circuit.non_signal_driver(NodePort::new(mux, 1));
        let mux_input2 = circuit.non_signal_driver(NodePort::new(mux, 2));
        let Some(mux_condition) = circuit.driver(NodePort::new(mux, 0)) else { continue };
        let group = circuit.node(reg).group;

        let feedback = NodePort::new(reg, 0);
        if mux_input1 == Some(feedback) {
            // Selector low holds the value, selector high loads input 2.
            let new_enable = and_with(circuit, group, enable, mux_condition);
            circuit.rewire_input(NodePort::new(reg, REG_ENABLE), new_enable);
            let load = circuit.driver(NodePort::new(mux, 2)).expect("mux branch");
            circuit.rewire_input(NodePort::new(reg, REG_DATA), load);
        } else if mux_input2 == Some(feedback) {
            let not = circuit.add_logic(LogicOp::Not);
            if let Some(group) = group {
                circuit.move_to_group(not, group);
            }
            circuit
                .connect_input(NodePort::new(not, 0), mux_condition)
                .expect("selector is boolean");
            let negated = NodePort::new(not, 0);
            let new_enable = and_with(circuit, group, enable, negated);
            circuit.rewire_input(NodePort::new(reg, REG_ENABLE), new_enable);
            let load = circuit.driver(NodePort::new(mux, 1)).expect("mux branch");
            circuit.rewire_input(NodePort::new(reg, REG_DATA), load);
        }
    }
}

fn and_with(
    circuit: &mut Circuit,
    group: Option<crate::group::GroupId>,
    existing: Option<NodePort>,
    condition: NodePort,
) -> NodePort {
    match existing {
        None => condition,
        Some(enable) => {
            let and = circuit.add_logic(LogicOp::And);
            if let Some(group) = group {
                circuit.move_to_group(and, group);
            }
            circuit.connect_input(NodePort::new(and, 0), enable).expect("boolean");
            circuit.connect_input(NodePort::new(and, 1), condition).expect("boolean");
            NodePort::new(and, 0)
        }
    }
}

/// Bypasses muxes whose selector is a fully defined constant.
pub fn remove_const_select_muxes(circuit: &mut Circuit) {
    for mux in circuit.node_ids() {
        if !circuit.contains_node(mux) {
            continue;
        }
        let NodeKind::Multiplexer { data_inputs } = &circuit.node(mux).kind else { continue };
        let data_inputs = *data_inputs;
        let Some(selector) = circuit.non_signal_driver(NodePort::new(mux, 0)) else { continue };
        let NodeKind::Constant { value, .. } = &circuit.node(selector.node).kind else { continue };
        if value.size() > 64 || !value.all_defined(0, value.size()) {
            continue;
        }
        let selected = value.extract(Plane::Value, 0, value.size()) as usize;
        if selected < data_inputs {
            circuit.bypass_output_to_input(mux, 0, 1 + selected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ConnectionType;
    use crate::state::{bit_state, value_state};

    fn input(c: &mut Circuit, ty: ConnectionType) -> NodePort {
        let pin = c.add_pin(crate::node::PinDirection::Input);
        c.node_mut(pin).output_mut(0).ty = ty;
        NodePort::new(pin, 0)
    }

    #[test]
    fn const_selector_bypasses_mux() {
        let mut c = Circuit::new();
        let sel = c.add_constant(bit_state(true), ConnectionType::Bool);
        let a = c.add_constant(value_state(7, 4), ConnectionType::BitVec(4));
        let b = c.add_constant(value_state(13, 4), ConnectionType::BitVec(4));
        let mux = c.add_mux(2);
        c.connect_input(NodePort::new(mux, 0), NodePort::new(sel, 0)).unwrap();
        c.connect_input(NodePort::new(mux, 1), NodePort::new(a, 0)).unwrap();
        c.connect_input(NodePort::new(mux, 2), NodePort::new(b, 0)).unwrap();
        let out = c.add_signal();
        c.node_mut(out).ref_count = 1;
        c.connect_input(NodePort::new(out, 0), NodePort::new(mux, 0)).unwrap();

        remove_const_select_muxes(&mut c);
        assert_eq!(c.driver(NodePort::new(out, 0)), Some(NodePort::new(b, 0)));
    }

    #[test]
    fn selector_negation_swaps_branches() {
        let mut c = Circuit::new();
        let sel = input(&mut c, ConnectionType::Bool);
        let not = c.add_logic(LogicOp::Not);
        c.connect_input(NodePort::new(not, 0), sel).unwrap();
        let a = input(&mut c, ConnectionType::BitVec(4));
        let b = input(&mut c, ConnectionType::BitVec(4));
        let mux = c.add_mux(2);
        c.connect_input(NodePort::new(mux, 0), NodePort::new(not, 0)).unwrap();
        c.connect_input(NodePort::new(mux, 1), a).unwrap();
        c.connect_input(NodePort::new(mux, 2), b).unwrap();

        cull_mux_condition_negations(&mut c);
        assert_eq!(c.driver(NodePort::new(mux, 0)), Some(sel));
        assert_eq!(c.driver(NodePort::new(mux, 1)), Some(b));
        assert_eq!(c.driver(NodePort::new(mux, 2)), Some(a));
    }

    #[test]
    fn chained_same_condition_muxes_merge() {
        let mut c = Circuit::new();
        let cond = input(&mut c, ConnectionType::Bool);
        let x = input(&mut c, ConnectionType::BitVec(4));
        let y = input(&mut c, ConnectionType::BitVec(4));
        let a = input(&mut c, ConnectionType::BitVec(4));

        let inner = c.add_mux(2);
        c.connect_input(NodePort::new(inner, 0), cond).unwrap();
        c.connect_input(NodePort::new(inner, 1), x).unwrap();
        c.connect_input(NodePort::new(inner, 2), y).unwrap();

        // outer = mux(cond, inner, a): when cond is low the inner mux also
        // picks its low branch, so the outer low branch can take x directly.
        let outer = c.add_mux(2);
        c.connect_input(NodePort::new(outer, 0), cond).unwrap();
        c.connect_input(NodePort::new(outer, 1), NodePort::new(inner, 0)).unwrap();
        c.connect_input(NodePort::new(outer, 2), a).unwrap();

        merge_muxes(&mut c);
        assert_eq!(c.driver(NodePort::new(outer, 1)), Some(x));
    }

    #[test]
    fn register_mux_feedback_becomes_enable() {
        let mut c = Circuit::new();
        let clk = c.create_root_clock("clk", crate::rational::rational(100, 1));
        let cond = input(&mut c, ConnectionType::Bool);
        let load = input(&mut c, ConnectionType::BitVec(8));
        let reg = c.add_register(clk);
        let mux = c.add_mux(2);
        c.connect_input(NodePort::new(mux, 0), cond).unwrap();
        c.connect_input(NodePort::new(mux, 1), NodePort::new(reg, 0)).unwrap();
        c.connect_input(NodePort::new(mux, 2), load).unwrap();
        c.connect_input(NodePort::new(reg, REG_DATA), NodePort::new(mux, 0)).unwrap();

        fold_register_mux_enable_loops(&mut c);

        assert_eq!(c.driver(NodePort::new(reg, REG_DATA)), Some(load));
        assert_eq!(c.driver(NodePort::new(reg, REG_ENABLE)), Some(cond));
    }
}
