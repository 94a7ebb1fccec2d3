use log::debug;

use crate::HashSet;
use crate::circuit::Circuit;
use crate::clock::ClockId;
use crate::errors::{DesignError, Result};
use crate::group::{GroupId, GroupType, MemoryGroupInfo, ReadPortInfo};
use crate::node::{
    CompareOp, ConnectionType, LogicOp, MemType, NodeId, NodeKind, NodePort, MEMPORT_ADDRESS,
    MEMPORT_ENABLE, MEMPORT_ORDER_AFTER, MEMPORT_ORDER_BEFORE, MEMPORT_RDDATA, MEMPORT_WRDATA,
    REG_DATA, REG_ENABLE, REG_RESET_VALUE,
};
use crate::optimizer::retiming::retime_backward_to_output;
use crate::state::{bit_state, Plane};

/// Whether port `a` comes before `b` on the memory's explicit order chain.
pub fn is_ordered_before(circuit: &Circuit, a: NodeId, b: NodeId) -> bool {
    let mut current = b;
    loop {
        let Some(prev) = circuit.non_signal_driver(NodePort::new(current, MEMPORT_ORDER_AFTER))
        else {
            return false;
        };
        if prev.node == a {
            return true;
        }
        current = prev.node;
    }
}

/// Number of ports chained before this one; a total sort key for ports on
/// one chain.
pub fn order_depth(circuit: &Circuit, port: NodeId) -> usize {
    let mut depth = 0;
    let mut current = port;
    while let Some(prev) = circuit.non_signal_driver(NodePort::new(current, MEMPORT_ORDER_AFTER)) {
        depth += 1;
        current = prev.node;
    }
    depth
}

/// Chains `port` after `prev` on the order chain (or detaches it).
pub fn order_after(circuit: &mut Circuit, port: NodeId, prev: Option<NodeId>) {
    match prev {
        Some(prev) => circuit.rewire_input(
            NodePort::new(port, MEMPORT_ORDER_AFTER),
            NodePort::new(prev, MEMPORT_ORDER_BEFORE),
        ),
        None => circuit.disconnect_input(NodePort::new(port, MEMPORT_ORDER_AFTER)),
    }
}

/// Forms an SFU group around every memory node: pulls in the memory, its
/// ports, and each read port's downstream register (when it qualifies as a
/// synchronous read register), and records the structure as group
/// metadata. Write-port clock agreement is enforced here.
pub fn find_memory_groups(circuit: &mut Circuit) -> Result<()> {
    let memories: Vec<NodeId> = circuit
        .nodes()
        .filter(|n| matches!(n.kind, NodeKind::Memory(_)))
        .map(|n| n.id)
        .collect();

    for memory in memories {
        // Already grouped on a previous pass run.
        let grouped = circuit
            .node(memory)
            .group
            .is_some_and(|g| {
                circuit.group(g).memory_info.as_ref().is_some_and(|i| i.memory == memory)
            });
        if grouped {
            continue;
        }
        let parent = circuit.node(memory).group.unwrap_or(circuit.root_group());
        let group = circuit.add_child_group(parent, GroupType::Sfu);
        let name = if circuit.node(memory).name.is_empty() {
            "memory".to_string()
        } else {
            circuit.node(memory).name.clone()
        };
        circuit.group_mut(group).name = name;
        circuit.group_mut(group).comment = "auto generated".into();
        circuit.move_to_group(memory, group);

        let mut info = MemoryGroupInfo {
            memory,
            read_ports: Vec::new(),
            write_ports: Vec::new(),
            fixup_group: None,
        };

        let ports: Vec<NodeId> = circuit
            .node(memory)
            .consumers(0)
            .iter()
            .map(|np| np.node)
            .collect();
        let mut first_write: Option<NodeId> = None;
        for port in ports {
            let NodeKind::MemPort(desc) = &circuit.node(port).kind else { continue };
            let desc = *desc;
            circuit.move_to_group(port, group);

            if desc.writes {
                if let Some(first) = first_write {
                    if circuit.node(first).clocks[0] != circuit.node(port).clocks[0] {
                        return Err(DesignError::WritePortClockMismatch {
                            first,
                            second: port,
                        });
                    }
                } else {
                    first_write = Some(port);
                }
                info.write_ports.push(port);
            }
            if desc.reads {
                let mut rp = ReadPortInfo {
                    port,
                    data_output: NodePort::new(port, MEMPORT_RDDATA),
                    sync_read_reg: None,
                };
                bind_sync_read_register(circuit, group, &mut rp);
                info.read_ports.push(rp);
            }
        }

        // Memories that are clearly too large for LUTs become block RAM.
        if let NodeKind::Memory(desc) = &circuit.node(memory).kind {
            if desc.mem_type == MemType::DontCare
                && !circuit.node(memory).consumers(0).is_empty()
                && desc.word_count() > 64
            {
                if let NodeKind::Memory(desc) = &mut circuit.node_mut(memory).kind {
                    desc.mem_type = MemType::Bram;
                }
            }
        }

        circuit.group_mut(group).memory_info = Some(info);
        debug!("formed memory group around {}", memory);
    }
    Ok(())
}

/// Follows the read data output through non-branching signal nodes looking
/// for a register without a reset. A branch means the unregistered value
/// is also consumed, which rules out fusing the register into the memory.
fn bind_sync_read_register(circuit: &mut Circuit, group: GroupId, rp: &mut ReadPortInfo) {
    let mut chain: Vec<NodeId> = Vec::new();
    let mut current = NodePort::new(rp.port, MEMPORT_RDDATA);
    loop {
        let consumers = circuit.node(current.node).consumers(current.port);
        if consumers.len() != 1 {
            return;
        }
        let next = consumers[0];
        let node = circuit.node(next.node);
        match &node.kind {
            NodeKind::Register { .. } if next.port == REG_DATA => {
                if circuit
                    .non_signal_driver(NodePort::new(next.node, REG_RESET_VALUE))
                    .is_some()
                {
                    return;
                }
                chain.push(next.node);
                rp.sync_read_reg = Some(next.node);
                rp.data_output = NodePort::new(next.node, 0);
                break;
            }
            NodeKind::Signal => {
                chain.push(next.node);
                current = NodePort::new(next.node, 0);
            }
            _ => return,
        }
    }

    for id in chain {
        circuit.move_to_group(id, group);
    }
    let reg = rp.sync_read_reg.expect("loop only breaks after binding");
    let flags = circuit.node_mut(reg).register_flags_mut().expect("register");
    flags.allow_retiming_backward = false;
    flags.allow_retiming_forward = false;
    flags.bound_to_memory = true;
}

/// Materializes read-during-write semantics and write-order arbitration
/// for every memory group, then verifies mapping constraints.
pub fn build_explicit_memory_circuitry(circuit: &mut Circuit) -> Result<()> {
    let groups: Vec<GroupId> = circuit
        .groups()
        .filter(|g| g.memory_info.is_some())
        .map(|g| g.id)
        .collect();
    for group in groups {
        convert_to_read_before_write(circuit, group);
        attempt_register_retiming(circuit, group)?;
        resolve_write_order(circuit, group);
        verify(circuit, group)?;
    }
    Ok(())
}

fn take_info(circuit: &mut Circuit, group: GroupId) -> MemoryGroupInfo {
    circuit.group_mut(group).memory_info.take().expect("memory group")
}

fn store_info(circuit: &mut Circuit, group: GroupId, info: MemoryGroupInfo) {
    circuit.group_mut(group).memory_info = Some(info);
}

fn lazy_fixup_group(circuit: &mut Circuit, group: GroupId, info: &mut MemoryGroupInfo) -> GroupId {
    if let Some(fixup) = info.fixup_group {
        return fixup;
    }
    let parent = circuit.group(group).parent.unwrap_or(circuit.root_group());
    let fixup = circuit.add_child_group(parent, GroupType::Entity);
    circuit.group_mut(fixup).name = "memory_helper".into();
    circuit.group_mut(fixup).comment =
        "auto generated to resolve read-during-write and read-modify-write hazards".into();
    info.fixup_group = Some(fixup);
    fixup
}

/// A memory read that is ordered after a write to the same address must
/// return the new value. The raw port reads the old content, so for every
/// (read, write) pair in that order, inject a comparator and forward the
/// write data into the read path on collision. Delayed (registered) read
/// paths get the comparator decision and the write data delayed the same
/// way. Afterwards the port chain is reordered so all reads precede all
/// writes; writes keep their pairwise order.
fn convert_to_read_before_write(circuit: &mut Circuit, group: GroupId) {
    let mut info = take_info(circuit, group);

    for rp in info.read_ports.clone() {
        // Conflicting writes resolve in write order; muxes are prepended,
        // so walk them from last to first.
        let mut sorted_writes: Vec<NodeId> = info
            .write_ports
            .iter()
            .copied()
            .filter(|wp| is_ordered_before(circuit, *wp, rp.port))
            .collect();
        sorted_writes.sort_by_key(|wp| std::cmp::Reverse(order_depth(circuit, *wp)));

        for wp in sorted_writes {
            let fixup = lazy_fixup_group(circuit, group, &mut info);

            let addr_cmp = circuit.add_compare(CompareOp::Eq);
            circuit.move_to_group(addr_cmp, fixup);
            circuit.node_mut(addr_cmp).comment = "compare read and write addr for conflicts".into();
            let rd_addr = circuit.driver(NodePort::new(rp.port, MEMPORT_ADDRESS)).expect("read addr");
            let wr_addr = circuit.driver(NodePort::new(wp, MEMPORT_ADDRESS)).expect("write addr");
            circuit.connect_input(NodePort::new(addr_cmp, 0), rd_addr).expect("addr");
            circuit.connect_input(NodePort::new(addr_cmp, 1), wr_addr).expect("addr");

            let mut conflict = NodePort::new(addr_cmp, 0);
            circuit.append_signal(&mut conflict);
            circuit.node_mut(conflict.node).set_name("conflict");

            if let Some(rd_en) = circuit.driver(NodePort::new(rp.port, MEMPORT_ENABLE)) {
                let and = circuit.add_logic(LogicOp::And);
                circuit.move_to_group(and, fixup);
                circuit.connect_input(NodePort::new(and, 0), conflict).expect("bool");
                circuit.connect_input(NodePort::new(and, 1), rd_en).expect("bool");
                conflict = NodePort::new(and, 0);
                circuit.append_signal(&mut conflict);
                circuit.node_mut(conflict.node).set_name("conflict_and_rd_en");
            }
            if let Some(wr_en) = circuit.driver(NodePort::new(wp, MEMPORT_ENABLE)) {
                let and = circuit.add_logic(LogicOp::And);
                circuit.move_to_group(and, fixup);
                circuit.connect_input(NodePort::new(and, 0), conflict).expect("bool");
                circuit.connect_input(NodePort::new(and, 1), wr_en).expect("bool");
                conflict = NodePort::new(and, 0);
                circuit.append_signal(&mut conflict);
                circuit.node_mut(conflict.node).set_name("conflict_and_wr_en");
            }

            let mut wr_data = circuit.driver(NodePort::new(wp, MEMPORT_WRDATA)).expect("write data");

            if let Some(sync_reg) = rp.sync_read_reg {
                // The read data is delayed by a register, so the bypass
                // data and the collision decision need the same delay.
                wr_data = delay_like(circuit, fixup, sync_reg, wr_data, "delayed_wr_data");
                conflict = delay_like(circuit, fixup, sync_reg, conflict, "delayed_conflict");
            }

            let consumers: Vec<NodePort> =
                circuit.node(rp.data_output.node).consumers(rp.data_output.port).to_vec();

            let mux = circuit.add_mux(2);
            circuit.move_to_group(mux, fixup);
            circuit.node_mut(mux).comment =
                "forward write data to the read output on address collision".into();
            circuit.connect_input(NodePort::new(mux, 0), conflict).expect("bool");
            circuit.connect_input(NodePort::new(mux, 1), rp.data_output).expect("data");
            circuit.connect_input(NodePort::new(mux, 2), wr_data).expect("data");

            let mut mux_out = NodePort::new(mux, 0);
            circuit.append_signal(&mut mux_out);
            circuit.node_mut(mux_out.node).set_name("conflict_bypass_mux");

            for consumer in consumers {
                circuit.rewire_input(consumer, mux_out);
            }
        }
    }

    // All reads first, then the writes in their previous pairwise order.
    let mut sorted_writes = info.write_ports.clone();
    sorted_writes.sort_by_key(|wp| order_depth(circuit, *wp));
    let mut last: Option<NodeId> = None;
    for rp in &info.read_ports {
        order_after(circuit, rp.port, last);
        last = Some(rp.port);
    }
    for wp in sorted_writes {
        order_after(circuit, wp, last);
        last = Some(wp);
    }

    store_info(circuit, group, info);
}

/// Clones the timing of `reference` (clock, enable, reset wiring) into a
/// fresh register delaying `value` by one cycle.
fn delay_like(
    circuit: &mut Circuit,
    group: GroupId,
    reference: NodeId,
    value: NodePort,
    name: &str,
) -> NodePort {
    let clock = circuit.node(reference).clocks[0].expect("reference register has a clock");
    let reg = circuit.add_register(clock);
    circuit.move_to_group(reg, group);
    for port in [REG_ENABLE, REG_RESET_VALUE] {
        if let Some(driver) = circuit.driver(NodePort::new(reference, port)) {
            circuit.connect_input(NodePort::new(reg, port), driver).expect("same wiring");
        }
    }
    circuit.connect_input(NodePort::new(reg, REG_DATA), value).expect("data");
    let mut out = NodePort::new(reg, 0);
    circuit.append_signal(&mut out);
    circuit.node_mut(out.node).set_name(name);
    out
}

/// An explicitly later write wins on address collision. Extends every
/// earlier write's enable with `addr1 != addr2 OR !en2` (conjunctively
/// with its own enable) so simultaneous same-address writes leave the
/// later value.
fn resolve_write_order(circuit: &mut Circuit, group: GroupId) {
    let mut info = take_info(circuit, group);

    let ports = info.write_ports.clone();
    for (i, &w1) in ports.iter().enumerate() {
        for (j, &w2) in ports.iter().enumerate() {
            if i == j {
                continue;
            }
            if !is_ordered_before(circuit, w1, w2) {
                continue;
            }
            let fixup = lazy_fixup_group(circuit, group, &mut info);

            let addr_cmp = circuit.add_compare(CompareOp::Neq);
            circuit.move_to_group(addr_cmp, fixup);
            circuit.node_mut(addr_cmp).comment =
                "the earlier write may proceed when the addresses differ".into();
            let a1 = circuit.driver(NodePort::new(w1, MEMPORT_ADDRESS)).expect("addr");
            let a2 = circuit.driver(NodePort::new(w2, MEMPORT_ADDRESS)).expect("addr");
            circuit.connect_input(NodePort::new(addr_cmp, 0), a1).expect("addr");
            circuit.connect_input(NodePort::new(addr_cmp, 1), a2).expect("addr");

            let mut new_enable = NodePort::new(addr_cmp, 0);
            circuit.append_signal(&mut new_enable);
            circuit.node_mut(new_enable.node).set_name("new_wr_en");

            // ... or when the later write is disabled anyway.
            if let Some(en2) = circuit.driver(NodePort::new(w2, MEMPORT_ENABLE)) {
                let not = circuit.add_logic(LogicOp::Not);
                circuit.move_to_group(not, fixup);
                circuit.connect_input(NodePort::new(not, 0), en2).expect("bool");
                let or = circuit.add_logic(LogicOp::Or);
                circuit.move_to_group(or, fixup);
                circuit.connect_input(NodePort::new(or, 0), new_enable).expect("bool");
                circuit.connect_input(NodePort::new(or, 1), NodePort::new(not, 0)).expect("bool");
                new_enable = NodePort::new(or, 0);
                circuit.append_signal(&mut new_enable);
                circuit.node_mut(new_enable.node).set_name("new_wr_en");
            }

            // ... and only when the earlier write wanted to write at all.
            if let Some(en1) = circuit.driver(NodePort::new(w1, MEMPORT_ENABLE)) {
                let and = circuit.add_logic(LogicOp::And);
                circuit.move_to_group(and, fixup);
                circuit.connect_input(NodePort::new(and, 0), new_enable).expect("bool");
                circuit.connect_input(NodePort::new(and, 1), en1).expect("bool");
                new_enable = NodePort::new(and, 0);
                circuit.append_signal(&mut new_enable);
                circuit.node_mut(new_enable.node).set_name("new_wr_en");
            }

            circuit.rewire_input(NodePort::new(w1, MEMPORT_ENABLE), new_enable);
        }
    }

    // Writes are now order-independent: chain reads first, then all
    // writes directly after the last read.
    let mut last: Option<NodeId> = None;
    for rp in &info.read_ports {
        order_after(circuit, rp.port, last);
        last = Some(rp.port);
    }
    for wp in info.write_ports.clone() {
        order_after(circuit, wp, last);
    }

    store_info(circuit, group, info);
}

/// For block RAM the read ports need their synchronous read register. Read
/// ports that lack one get the nearest downstream register pulled onto
/// them; write ports delayed by that move are gated off for the first
/// cycle after reset and covered by read-modify-write hazard logic.
fn attempt_register_retiming(circuit: &mut Circuit, group: GroupId) -> Result<()> {
    let mut info = take_info(circuit, group);
    let memory = info.memory;
    let is_bram = matches!(
        &circuit.node(memory).kind,
        NodeKind::Memory(desc) if desc.mem_type == MemType::Bram
    );
    if !is_bram {
        store_info(circuit, group, info);
        return Ok(());
    }

    let retimeable: HashSet<NodeId> = info.write_ports.iter().copied().collect();
    let mut actually_retimed: Vec<NodeId> = Vec::new();

    let unregistered: Vec<(usize, NodeId)> = info
        .read_ports
        .iter()
        .enumerate()
        .filter(|(_, rp)| rp.sync_read_reg.is_none())
        .map(|(i, rp)| (i, rp.port))
        .collect();
    for (rp_index, port) in unregistered {
        let Some(result) = retime_backward_to_output(
            circuit,
            NodePort::new(port, MEMPORT_RDDATA),
            &retimeable,
        ) else {
            continue;
        };

        let reg = result.new_register;
        circuit.move_to_group(reg, group);
        let flags = circuit.node_mut(reg).register_flags_mut().expect("register");
        flags.allow_retiming_backward = false;
        flags.allow_retiming_forward = false;
        flags.bound_to_memory = true;
        info.read_ports[rp_index].sync_read_reg = Some(reg);
        info.read_ports[rp_index].data_output = NodePort::new(reg, 0);

        for wp in result.delayed_write_ports {
            let fixup = lazy_fixup_group(circuit, group, &mut info);
            ensure_not_enabled_first_cycle(circuit, fixup, wp);
            if !actually_retimed.contains(&wp) {
                actually_retimed.push(wp);
            }
        }
    }

    if !actually_retimed.is_empty() {
        actually_retimed.sort_by_key(|wp| order_depth(circuit, *wp));
        let fixup = lazy_fixup_group(circuit, group, &mut info);
        build_rmw_hazard_logic(circuit, fixup, &info, &actually_retimed);
    }

    store_info(circuit, group, info);
    Ok(())
}

/// A retimed write port lags a cycle behind reset deassertion, so its
/// enable must be forced low in the very first cycle. Reuses an existing
/// zero-resetting enable register when possible, otherwise builds the
/// canonical zero-then-one register.
fn ensure_not_enabled_first_cycle(circuit: &mut Circuit, group: GroupId, write_port: NodeId) {
    let enable_driver = circuit.non_signal_driver(NodePort::new(write_port, MEMPORT_ENABLE));

    if let Some(enable) = enable_driver {
        if matches!(circuit.node(enable.node).kind, NodeKind::Register { .. }) {
            let reg = enable.node;
            if let Some(reset) = circuit.node(reg).reset_constant(circuit) {
                if reset.size() == 1
                    && reset.get(Plane::Defined, 0)
                    && !reset.get(Plane::Value, 0)
                {
                    return; // already resets to zero
                }
            }

            // The reset can be changed when the register only feeds this
            // enable (possibly through signals).
            let mut only_user = true;
            let mut walk = circuit.explore_output(NodePort::new(reg, 0));
            while let Some(h) = walk.next_node() {
                if circuit.node(h.node).is_signal() {
                    continue;
                }
                if h.node == write_port && h.port == MEMPORT_ENABLE {
                    walk.backtrack();
                    continue;
                }
                only_user = false;
                break;
            }
            if only_user
                && circuit.driver(NodePort::new(reg, REG_RESET_VALUE)).is_none()
            {
                let zero = circuit.add_constant(bit_state(false), ConnectionType::Bool);
                circuit.move_to_group(zero, group);
                circuit
                    .connect_input(NodePort::new(reg, REG_RESET_VALUE), NodePort::new(zero, 0))
                    .expect("bool");
                return;
            }
        }
    }

    // Build the zero-after-reset, one-afterwards register.
    let zero = circuit.add_constant(bit_state(false), ConnectionType::Bool);
    circuit.move_to_group(zero, group);
    let one = circuit.add_constant(bit_state(true), ConnectionType::Bool);
    circuit.move_to_group(one, group);

    let clock = circuit.node(write_port).clocks[0].expect("write port has a clock");
    let reg = circuit.add_register(clock);
    circuit.move_to_group(reg, group);
    circuit.node_mut(reg).comment = "zero after reset, one on all later cycles".into();
    circuit
        .connect_input(NodePort::new(reg, REG_RESET_VALUE), NodePort::new(zero, 0))
        .expect("bool");
    circuit
        .connect_input(NodePort::new(reg, REG_DATA), NodePort::new(one, 0))
        .expect("bool");

    let mut new_enable = NodePort::new(reg, 0);
    if let Some(enable) = circuit.driver(NodePort::new(write_port, MEMPORT_ENABLE)) {
        let and = circuit.add_logic(LogicOp::And);
        circuit.move_to_group(and, group);
        circuit.node_mut(and).comment =
            "retiming delayed this write port by a cycle, keep it quiet until then".into();
        circuit.connect_input(NodePort::new(and, 0), new_enable).expect("bool");
        circuit.connect_input(NodePort::new(and, 1), enable).expect("bool");
        new_enable = NodePort::new(and, 0);
    }
    circuit.rewire_input(NodePort::new(write_port, MEMPORT_ENABLE), new_enable);
}

/// Read-modify-write hazard detection for delayed write ports: the read
/// address and enable are delayed to line up with the delayed write, the
/// addresses compared, and the write data muxed over the registered read
/// output. Writes later in program order sit closer to the output, so the
/// last write wins.
fn build_rmw_hazard_logic(
    circuit: &mut Circuit,
    fixup: GroupId,
    info: &MemoryGroupInfo,
    retimed_writes: &[NodeId],
) {
    for rp in &info.read_ports {
        let Some(sync_reg) = rp.sync_read_reg else { continue };

        let rd_addr = circuit
            .driver(NodePort::new(rp.port, MEMPORT_ADDRESS))
            .expect("read addr");
        let delayed_addr = delay_like(circuit, fixup, sync_reg, rd_addr, "rmw_delayed_rd_addr");
        let delayed_en = circuit
            .driver(NodePort::new(rp.port, MEMPORT_ENABLE))
            .map(|en| delay_like(circuit, fixup, sync_reg, en, "rmw_delayed_rd_en"));

        let consumers: Vec<NodePort> =
            circuit.node(rp.data_output.node).consumers(rp.data_output.port).to_vec();
        let mut bypass = rp.data_output;

        for wp in retimed_writes {
            let addr_cmp = circuit.add_compare(CompareOp::Eq);
            circuit.move_to_group(addr_cmp, fixup);
            let wr_addr = circuit.driver(NodePort::new(*wp, MEMPORT_ADDRESS)).expect("addr");
            circuit.connect_input(NodePort::new(addr_cmp, 0), delayed_addr).expect("addr");
            circuit.connect_input(NodePort::new(addr_cmp, 1), wr_addr).expect("addr");

            let mut conflict = NodePort::new(addr_cmp, 0);
            if let Some(en) = delayed_en {
                let and = circuit.add_logic(LogicOp::And);
                circuit.move_to_group(and, fixup);
                circuit.connect_input(NodePort::new(and, 0), conflict).expect("bool");
                circuit.connect_input(NodePort::new(and, 1), en).expect("bool");
                conflict = NodePort::new(and, 0);
            }
            if let Some(wr_en) = circuit.driver(NodePort::new(*wp, MEMPORT_ENABLE)) {
                let and = circuit.add_logic(LogicOp::And);
                circuit.move_to_group(and, fixup);
                circuit.connect_input(NodePort::new(and, 0), conflict).expect("bool");
                circuit.connect_input(NodePort::new(and, 1), wr_en).expect("bool");
                conflict = NodePort::new(and, 0);
            }

            let wr_data = circuit.driver(NodePort::new(*wp, MEMPORT_WRDATA)).expect("data");
            let mux = circuit.add_mux(2);
            circuit.move_to_group(mux, fixup);
            circuit.node_mut(mux).comment = "read-modify-write hazard bypass".into();
            circuit.connect_input(NodePort::new(mux, 0), conflict).expect("bool");
            circuit.connect_input(NodePort::new(mux, 1), bypass).expect("data");
            circuit.connect_input(NodePort::new(mux, 2), wr_data).expect("data");
            bypass = NodePort::new(mux, 0);
        }

        if bypass != rp.data_output {
            for consumer in consumers {
                circuit.rewire_input(consumer, bypass);
            }
        }
    }
}

/// Mapping constraints for the chosen memory type.
fn verify(circuit: &Circuit, group: GroupId) -> Result<()> {
    let info = circuit.group(group).memory_info.as_ref().expect("memory group");
    let mem_type = match &circuit.node(info.memory).kind {
        NodeKind::Memory(desc) => desc.mem_type,
        _ => return Ok(()),
    };
    match mem_type {
        MemType::Bram => {
            for rp in &info.read_ports {
                if rp.sync_read_reg.is_none() {
                    return Err(DesignError::MemoryMapping {
                        memory: info.memory,
                        reason: format!(
                            "read port {} has no synchronous read register, cannot map to block RAM",
                            rp.port
                        ),
                    });
                }
            }
        }
        MemType::Lutram => {
            if info.read_ports.len() > 1 || info.write_ports.len() > 1 {
                return Err(DesignError::MemoryMapping {
                    memory: info.memory,
                    reason: "LUT RAM supports at most one read and one write port".into(),
                });
            }
        }
        MemType::DontCare | MemType::External => {}
    }
    Ok(())
}

/// Whether `clock` can drive the generated hazard registers for `ports`;
/// retiming across memory ports requires clock agreement.
pub fn clocks_agree(circuit: &Circuit, clock: ClockId, ports: &[NodeId]) -> bool {
    ports
        .iter()
        .all(|p| circuit.node(*p).clocks.first().copied().flatten() == Some(clock))
}
