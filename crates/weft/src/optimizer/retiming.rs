use log::debug;

use crate::HashSet;
use crate::circuit::Circuit;
use crate::node::{
    NodeId, NodeKind, NodePort, MEMPORT_ADDRESS, MEMPORT_ENABLE, MEMPORT_WRDATA, REG_DATA,
    REG_ENABLE, REG_RESET_VALUE,
};
use crate::subnet::Subnet;

/// Outcome of a successful backward retiming: the combinational area the
/// register was pulled across, the write ports that ended up delayed by a
/// cycle, and the freshly created register now sitting on the output.
pub struct RetimingResult {
    pub area: Subnet,
    pub delayed_write_ports: Vec<NodeId>,
    pub new_register: NodeId,
}

/// Pulls the nearest downstream register backward across a purely
/// combinational area onto `output` (typically a memory read port's data
/// output). Latency along every path is preserved: the area's outputs used
/// to be registered once, and still are.
///
/// The attempt silently fails (returns `None`) unless the area is safe to
/// move: exactly one frontier register, eligible for backward retiming,
/// no external area inputs besides `output` and constants, and any write
/// ports on the frontier from the allowed set and on the same clock.
pub fn retime_backward_to_output(
    circuit: &mut Circuit,
    output: NodePort,
    allowed_write_ports: &HashSet<NodeId>,
) -> Option<RetimingResult> {
    let mut area = Subnet::new();
    let mut frontier_regs: Vec<NodeId> = Vec::new();
    let mut frontier_writes: Vec<NodeId> = Vec::new();

    let mut open: Vec<NodePort> = circuit.node(output.node).consumers(output.port).to_vec();
    let mut seen: HashSet<NodePort> = HashSet::default();
    while let Some(np) = open.pop() {
        if !seen.insert(np) {
            continue;
        }
        let node = circuit.node(np.node);
        match &node.kind {
            NodeKind::Register { flags } => {
                if np.port != REG_DATA {
                    return None;
                }
                if flags.bound_to_memory || node.has_ref() {
                    return None;
                }
                if circuit
                    .non_signal_driver(NodePort::new(np.node, REG_RESET_VALUE))
                    .is_some()
                {
                    return None;
                }
                if !frontier_regs.contains(&np.node) {
                    frontier_regs.push(np.node);
                }
            }
            NodeKind::MemPort(desc) if desc.writes => {
                if !allowed_write_ports.contains(&np.node) {
                    return None;
                }
                if !matches!(np.port, MEMPORT_ADDRESS | MEMPORT_ENABLE | MEMPORT_WRDATA) {
                    return None;
                }
                if !frontier_writes.contains(&np.node) {
                    frontier_writes.push(np.node);
                }
            }
            _ => {
                if !node.is_combinational() || node.has_side_effects() {
                    return None;
                }
                area.insert(np.node);
                for port in 0..node.num_output_ports() {
                    for consumer in node.consumers(port) {
                        open.push(*consumer);
                    }
                }
            }
        }
    }

    let [reg] = frontier_regs.as_slice() else { return None };
    let reg = *reg;
    let clock = circuit.node(reg).clocks[0]?;

    // Delayed write ports must advance on the same clock as the register
    // being moved, and all their data-side inputs must come from the area.
    for wp in &frontier_writes {
        if circuit.node(*wp).clocks[0] != Some(clock) {
            return None;
        }
        for port in [MEMPORT_ADDRESS, MEMPORT_ENABLE, MEMPORT_WRDATA] {
            let Some(driver) = circuit.driver(NodePort::new(*wp, port)) else { continue };
            if !driver_within(circuit, driver, &area, output) {
                return None;
            }
        }
    }

    // The area may only be fed by the retimed output and by constants.
    for id in area.iter() {
        let node = circuit.node(id);
        for port in 0..node.num_input_ports() {
            let Some(driver) = node.driver(port) else { continue };
            if !driver_within(circuit, driver, &area, output) {
                return None;
            }
        }
    }

    // Transform: insert a fresh register right behind `output`, then short
    // out the frontier register.
    let new_reg = circuit.add_register(clock);
    if let Some(group) = circuit.node(output.node).group {
        circuit.move_to_group(new_reg, group);
    }
    if let Some(enable) = circuit.driver(NodePort::new(reg, REG_ENABLE)) {
        circuit
            .connect_input(NodePort::new(new_reg, REG_ENABLE), enable)
            .expect("enable is boolean");
    }

    let consumers: Vec<NodePort> = circuit.node(output.node).consumers(output.port).to_vec();
    circuit
        .connect_input(NodePort::new(new_reg, REG_DATA), output)
        .expect("register adopts data type");
    for consumer in consumers {
        circuit.rewire_input(consumer, NodePort::new(new_reg, 0));
    }

    circuit.bypass_output_to_input(reg, 0, REG_DATA);
    circuit.remove_node(reg);

    debug!(
        "retimed register across {} combinational nodes onto {}",
        area.len(),
        output.node
    );
    Some(RetimingResult {
        area,
        delayed_write_ports: frontier_writes,
        new_register: new_reg,
    })
}

fn driver_within(circuit: &Circuit, driver: NodePort, area: &Subnet, output: NodePort) -> bool {
    // Signal buffers between producers don't change where a value comes from.
    let mut driver = driver;
    loop {
        if driver == output || area.contains(driver.node) {
            return true;
        }
        let node = circuit.node(driver.node);
        if node.is_signal() {
            match node.driver(0) {
                Some(next) => driver = next,
                None => return false,
            }
            continue;
        }
        return matches!(node.kind, NodeKind::Constant { .. });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ArithOp, ConnectionType};
    use crate::state::value_state;

    /// read-like output -> add const -> register becomes
    /// read-like output -> register -> add const.
    #[test]
    fn pulls_register_across_combinational_node() {
        let mut c = Circuit::new();
        let clk = c.create_root_clock("clk", crate::rational::rational(100, 1));
        let src = c.add_pin(crate::node::PinDirection::Input);
        c.node_mut(src).output_mut(0).ty = ConnectionType::BitVec(8);
        let one = c.add_constant(value_state(1, 8), ConnectionType::BitVec(8));
        let add = c.add_arithmetic(ArithOp::Add);
        c.connect_input(NodePort::new(add, 0), NodePort::new(src, 0)).unwrap();
        c.connect_input(NodePort::new(add, 1), NodePort::new(one, 0)).unwrap();
        let reg = c.add_register(clk);
        c.connect_input(NodePort::new(reg, REG_DATA), NodePort::new(add, 0)).unwrap();
        let sink = c.add_pin(crate::node::PinDirection::Output);
        c.connect_input(NodePort::new(sink, 0), NodePort::new(reg, 0)).unwrap();

        let res =
            retime_backward_to_output(&mut c, NodePort::new(src, 0), &HashSet::default()).unwrap();
        assert!(res.delayed_write_ports.is_empty());
        assert!(!c.contains_node(reg));

        // The new register now sits directly behind the source...
        let new_reg = res.new_register;
        assert_eq!(c.driver(NodePort::new(new_reg, REG_DATA)), Some(NodePort::new(src, 0)));
        // ...the adder reads the registered value...
        assert_eq!(c.driver(NodePort::new(add, 0)), Some(NodePort::new(new_reg, 0)));
        // ...and the sink reads the adder combinationally.
        assert_eq!(c.driver(NodePort::new(sink, 0)), Some(NodePort::new(add, 0)));
    }

    #[test]
    fn refuses_external_inputs_into_area() {
        let mut c = Circuit::new();
        let clk = c.create_root_clock("clk", crate::rational::rational(100, 1));
        let src = c.add_pin(crate::node::PinDirection::Input);
        c.node_mut(src).output_mut(0).ty = ConnectionType::BitVec(8);
        let other = c.add_pin(crate::node::PinDirection::Input);
        c.node_mut(other).output_mut(0).ty = ConnectionType::BitVec(8);
        let add = c.add_arithmetic(ArithOp::Add);
        c.connect_input(NodePort::new(add, 0), NodePort::new(src, 0)).unwrap();
        c.connect_input(NodePort::new(add, 1), NodePort::new(other, 0)).unwrap();
        let reg = c.add_register(clk);
        c.connect_input(NodePort::new(reg, REG_DATA), NodePort::new(add, 0)).unwrap();

        assert!(
            retime_backward_to_output(&mut c, NodePort::new(src, 0), &HashSet::default()).is_none()
        );
        assert!(c.contains_node(reg));
    }
}
