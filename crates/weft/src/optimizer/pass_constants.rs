use log::debug;

use crate::circuit::Circuit;
use crate::node::{NodeId, NodeKind, NodePort, REG_DATA, REG_RESET_VALUE};
use crate::state::{BitVecState, Plane, UNCONNECTED};

/// Worklist constant propagation. Starting from every constant node, any
/// combinational, side-effect-free, stateless successor whose output
/// evaluates fully defined is replaced by a fresh constant node. Registers
/// without a reset value are bypassed on the data path so propagation can
/// continue through them.
pub fn propagate_constants(circuit: &mut Circuit) {
    let mut open: Vec<NodePort> = circuit
        .nodes()
        .filter(|n| matches!(n.kind, NodeKind::Constant { .. }))
        .map(|n| NodePort::new(n.id, 0))
        .collect();
    let mut folded = 0usize;

    while let Some(const_port) = open.pop() {
        if !circuit.contains_node(const_port.node) {
            continue;
        }
        let successors: Vec<NodePort> = circuit.node(const_port.node).consumers(const_port.port).to_vec();
        for successor in successors {
            if !circuit.contains_node(successor.node) {
                continue;
            }
            let node = circuit.node(successor.node);

            // Signals pass constants through unchanged.
            if node.is_signal() {
                open.push(NodePort::new(successor.node, 0));
                continue;
            }

            // A register without a reset behaves like a wire for a constant
            // input: from the second cycle on it holds the constant, and
            // before that it is undefined either way.
            if matches!(node.kind, NodeKind::Register { .. })
                && successor.port == REG_DATA
                && circuit
                    .non_signal_driver(NodePort::new(successor.node, REG_RESET_VALUE))
                    .is_none()
            {
                circuit.bypass_output_to_input(successor.node, 0, REG_DATA);
                circuit.disconnect_input(NodePort::new(successor.node, REG_DATA));
                open.push(const_port);
                continue;
            }

            if !node.is_combinational() || node.has_side_effects() {
                continue;
            }
            if !node.internal_state_sizes().is_empty() {
                continue;
            }

            let Some((outputs, scratch, output_offsets)) = evaluate_with_const_inputs(circuit, successor.node)
            else {
                continue;
            };

            for port in 0..outputs {
                let ty = circuit.node(successor.node).output(port).ty;
                let width = ty.width();
                if width == 0 || !scratch.all_defined(output_offsets[port], width) {
                    continue;
                }
                if circuit.node(successor.node).consumers(port).is_empty() {
                    continue;
                }

                let value = scratch.extract_state(output_offsets[port], width);
                let constant = circuit.add_constant(value, ty);
                if let Some(group) = circuit.node(successor.node).group {
                    circuit.move_to_group(constant, group);
                }
                let new_port = NodePort::new(constant, 0);
                let consumers: Vec<NodePort> =
                    circuit.node(successor.node).consumers(port).to_vec();
                for consumer in consumers {
                    circuit.rewire_input(consumer, new_port);
                }
                open.push(new_port);
                folded += 1;
            }
        }
    }
    if folded > 0 {
        debug!("constant propagation folded {} outputs", folded);
    }
}

/// Builds a scratch state with the node's constant inputs materialized and
/// everything else undefined, then runs the node's own evaluation.
fn evaluate_with_const_inputs(
    circuit: &Circuit,
    node_id: NodeId,
) -> Option<(usize, BitVecState, Vec<usize>)> {
    let node = circuit.node(node_id);
    let mut scratch = BitVecState::new(0);
    let mut input_offsets = vec![UNCONNECTED; node.num_input_ports()];

    for port in 0..node.num_input_ports() {
        let Some(driver) = circuit.non_signal_driver(NodePort::new(node_id, port)) else {
            continue;
        };
        let width = circuit.output_type(driver).width();
        let offset = scratch.size();
        scratch.resize(offset + width.max(1));
        input_offsets[port] = offset;
        match &circuit.node(driver.node).kind {
            NodeKind::Constant { value, .. } => {
                scratch.copy_range(offset, value, 0, width.min(value.size()));
            }
            _ => scratch.clear_range(Plane::Defined, offset, width),
        }
    }

    let num_outputs = node.num_output_ports();
    let mut output_offsets = vec![0usize; num_outputs];
    for (port, slot) in output_offsets.iter_mut().enumerate() {
        let width = node.output(port).ty.width();
        let offset = scratch.size();
        scratch.resize(offset + width.max(1));
        *slot = offset;
    }

    node.simulate_evaluate(circuit, &mut scratch, &[], &input_offsets, &output_offsets);
    Some((num_outputs, scratch, output_offsets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ArithOp, ConnectionType, LogicOp};
    use crate::state::value_state;

    #[test]
    fn folds_arithmetic_on_constants() {
        let mut c = Circuit::new();
        let a = c.add_constant(value_state(3, 8), ConnectionType::BitVec(8));
        let b = c.add_constant(value_state(4, 8), ConnectionType::BitVec(8));
        let add = c.add_arithmetic(ArithOp::Add);
        c.connect_input(NodePort::new(add, 0), NodePort::new(a, 0)).unwrap();
        c.connect_input(NodePort::new(add, 1), NodePort::new(b, 0)).unwrap();
        let out = c.add_signal();
        c.node_mut(out).set_name("sum");
        c.node_mut(out).ref_count = 1;
        c.connect_input(NodePort::new(out, 0), NodePort::new(add, 0)).unwrap();

        propagate_constants(&mut c);

        let driver = c.driver(NodePort::new(out, 0)).unwrap();
        match &c.node(driver.node).kind {
            NodeKind::Constant { value, .. } => {
                assert_eq!(value.extract(Plane::Value, 0, 8), 7);
            }
            other => panic!("expected constant driver, got {:?}", other),
        }
    }

    #[test]
    fn partial_constants_stay() {
        let mut c = Circuit::new();
        let a = c.add_constant(value_state(3, 8), ConnectionType::BitVec(8));
        let pin = c.add_pin(crate::node::PinDirection::Input);
        c.node_mut(pin).output_mut(0).ty = ConnectionType::BitVec(8);
        let and = c.add_logic(LogicOp::And);
        c.connect_input(NodePort::new(and, 0), NodePort::new(a, 0)).unwrap();
        c.connect_input(NodePort::new(and, 1), NodePort::new(pin, 0)).unwrap();
        let out = c.add_signal();
        c.node_mut(out).ref_count = 1;
        c.connect_input(NodePort::new(out, 0), NodePort::new(and, 0)).unwrap();

        propagate_constants(&mut c);

        // The AND still depends on the pin, so it must survive.
        assert_eq!(c.driver(NodePort::new(out, 0)), Some(NodePort::new(and, 0)));
    }

    #[test]
    fn all_zero_and_folds_even_with_undefined_side() {
        // 0 AND x is 0 regardless of x, so the fold applies.
        let mut c = Circuit::new();
        let zero = c.add_constant(value_state(0, 4), ConnectionType::BitVec(4));
        let pin = c.add_pin(crate::node::PinDirection::Input);
        c.node_mut(pin).output_mut(0).ty = ConnectionType::BitVec(4);
        let and = c.add_logic(LogicOp::And);
        c.connect_input(NodePort::new(and, 0), NodePort::new(zero, 0)).unwrap();
        c.connect_input(NodePort::new(and, 1), NodePort::new(pin, 0)).unwrap();
        let out = c.add_signal();
        c.node_mut(out).ref_count = 1;
        c.connect_input(NodePort::new(out, 0), NodePort::new(and, 0)).unwrap();

        propagate_constants(&mut c);

        let driver = c.driver(NodePort::new(out, 0)).unwrap();
        match &c.node(driver.node).kind {
            NodeKind::Constant { value, .. } => {
                assert_eq!(value.extract(Plane::Value, 0, 4), 0);
            }
            other => panic!("expected constant driver, got {:?}", other),
        }
    }
}
