use log::debug;

use crate::HashMap;
use crate::circuit::Circuit;
use crate::group::GroupType;
use crate::node::{NodeId, NodePort};

/// Removes signal nodes without any connections.
pub fn cull_orphaned_signal_nodes(circuit: &mut Circuit) {
    let mut removed = 0usize;
    for id in circuit.node_ids() {
        let node = circuit.node(id);
        if node.is_signal() && !node.has_ref() && node.is_orphaned() {
            circuit.remove_node(id);
            removed += 1;
        }
    }
    if removed > 0 {
        debug!("culled {} orphaned signal nodes", removed);
    }
}

/// Removes unnamed signal nodes that sit between other signals. One signal
/// node is kept between non-signal producers and consumers; named or
/// frontend-referenced signals always survive.
pub fn cull_unnamed_signal_nodes(circuit: &mut Circuit) {
    let mut removed = 0usize;
    for id in circuit.node_ids() {
        if !circuit.contains_node(id) {
            continue;
        }
        let node = circuit.node(id);
        if !node.is_signal() || !node.name.is_empty() || node.has_ref() {
            continue;
        }

        let driver = node.driver(0);
        let input_is_signal_or_unconnected = match driver {
            None => true,
            Some(d) => circuit.node(d.node).is_signal(),
        };
        let all_outputs_are_signals = node
            .consumers(0)
            .iter()
            .all(|c| circuit.node(c.node).is_signal());

        if input_is_signal_or_unconnected || all_outputs_are_signals {
            if driver.map(|d| d.node) != Some(id) {
                circuit.bypass_output_to_input(id, 0, 0);
            }
            circuit.disconnect_input(NodePort::new(id, 0));
            circuit.remove_node(id);
            removed += 1;
        }
    }
    if removed > 0 {
        debug!("culled {} unnamed signal nodes", removed);
    }
}

/// Collapses chains of signal nodes that repeat the same name, comment,
/// and group.
pub fn cull_sequentially_duplicated_signal_nodes(circuit: &mut Circuit) {
    for id in circuit.node_ids() {
        if !circuit.contains_node(id) {
            continue;
        }
        let node = circuit.node(id);
        if !node.is_signal() || node.has_ref() {
            continue;
        }
        let Some(driver) = node.driver(0) else { continue };
        if driver.node == id {
            continue;
        }
        let driver_node = circuit.node(driver.node);
        if driver_node.is_signal()
            && driver_node.name == node.name
            && driver_node.comment == node.comment
            && driver_node.group == node.group
        {
            circuit.bypass_output_to_input(id, 0, 0);
            circuit.disconnect_input(NodePort::new(id, 0));
            circuit.remove_node(id);
        }
    }
}

/// Deletes nodes that drive nothing, have no side effects, and are not
/// referenced by the frontend. Runs to a fixed point: removing a node can
/// orphan its drivers.
pub fn cull_unused_nodes(circuit: &mut Circuit) {
    let mut removed = 0usize;
    loop {
        let mut done = true;
        for id in circuit.node_ids() {
            if !circuit.contains_node(id) {
                continue;
            }
            let node = circuit.node(id);
            if node.has_side_effects() || node.has_ref() {
                continue;
            }
            let unused = (0..node.num_output_ports()).all(|p| node.consumers(p).is_empty());
            if unused {
                circuit.remove_node(id);
                removed += 1;
                done = false;
            }
        }
        if done {
            break;
        }
    }
    if removed > 0 {
        debug!("culled {} unused nodes", removed);
    }
}

/// Inserts a signal node between any non-signal producer and non-signal
/// consumer. Export backends rely on these as named wires; one buffer is
/// shared per driver.
pub fn ensure_signal_node_placement(circuit: &mut Circuit) {
    let mut added: HashMap<NodePort, NodeId> = HashMap::default();

    for id in circuit.node_ids() {
        if circuit.node(id).is_signal() {
            continue;
        }
        for port in 0..circuit.node(id).num_input_ports() {
            let input = NodePort::new(id, port);
            let Some(driver) = circuit.driver(input) else { continue };
            if circuit.output_type(driver).is_dependency() {
                continue;
            }
            if circuit.node(driver.node).is_signal() {
                continue;
            }
            if let Some(group) = circuit.node(driver.node).group {
                if circuit.group(group).group_type == GroupType::Sfu {
                    continue;
                }
            }

            if let Some(signal) = added.get(&driver) {
                circuit.rewire_input(input, NodePort::new(*signal, 0));
            } else {
                let signal = circuit.add_signal();
                if let Some(group) = circuit.node(driver.node).group {
                    circuit.move_to_group(signal, group);
                }
                circuit
                    .connect_input(NodePort::new(signal, 0), driver)
                    .expect("signal nodes accept any type");
                circuit.rewire_input(input, NodePort::new(signal, 0));
                added.insert(driver, signal);
            }
        }
    }
}

/// Names unnamed signal nodes from the first named producer behind them,
/// walking driver chains and asking each node to describe its output.
pub fn infer_signal_names(circuit: &mut Circuit) {
    let mut unnamed: Vec<NodeId> = circuit
        .nodes()
        .filter(|n| n.is_signal() && n.name.is_empty())
        .map(|n| n.id)
        .collect();
    unnamed.sort();
    let mut pending: crate::HashSet<NodeId> = unnamed.iter().copied().collect();

    for start in unnamed {
        if !pending.contains(&start) {
            continue;
        }

        // Collect the chain of unnamed signals feeding this one; deepest
        // names resolve first so the chain can build on them.
        let mut to_name = vec![start];
        let mut on_chain: crate::HashSet<NodeId> = [start].into_iter().collect();
        let mut walk = circuit.explore_input(NodePort::new(start, 0)).skip_dependencies();
        while let Some(h) = walk.next_node() {
            if !circuit.node(h.node).is_signal() {
                continue;
            }
            if on_chain.contains(&h.node) {
                walk.backtrack();
            } else if !circuit.node(h.node).name.is_empty() {
                walk.backtrack();
            } else {
                to_name.push(h.node);
                on_chain.insert(h.node);
            }
        }

        for id in to_name.into_iter().rev() {
            if circuit.node(id).name.is_empty() {
                let inferred = match circuit.driver(NodePort::new(id, 0)) {
                    Some(driver) => circuit
                        .node(driver.node)
                        .attempt_infer_output_name(circuit, driver.port),
                    None => Some("undefined".to_string()),
                };
                if let Some(name) = inferred {
                    circuit.node_mut(id).set_inferred_name(name);
                }
            }
            pending.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ConnectionType, LogicOp};
    use crate::state::bit_state;

    #[test]
    fn unnamed_signal_chains_collapse_to_one() {
        let mut c = Circuit::new();
        let a = c.add_constant(bit_state(true), ConnectionType::Bool);
        let s1 = c.add_signal();
        let s2 = c.add_signal();
        let not = c.add_logic(LogicOp::Not);
        c.connect_input(NodePort::new(s1, 0), NodePort::new(a, 0)).unwrap();
        c.connect_input(NodePort::new(s2, 0), NodePort::new(s1, 0)).unwrap();
        c.connect_input(NodePort::new(not, 0), NodePort::new(s2, 0)).unwrap();

        cull_unnamed_signal_nodes(&mut c);

        // One signal survives between the constant and the NOT.
        let live_signals: Vec<_> = c.nodes().filter(|n| n.is_signal()).collect();
        assert_eq!(live_signals.len(), 1);
        let kept = live_signals[0].id;
        assert_eq!(c.driver(NodePort::new(not, 0)), Some(NodePort::new(kept, 0)));
    }

    #[test]
    fn named_signals_survive() {
        let mut c = Circuit::new();
        let a = c.add_constant(bit_state(true), ConnectionType::Bool);
        let s = c.add_signal();
        c.node_mut(s).set_name("important");
        c.connect_input(NodePort::new(s, 0), NodePort::new(a, 0)).unwrap();

        cull_unnamed_signal_nodes(&mut c);
        cull_unused_nodes(&mut c);
        assert!(c.contains_node(s));
    }

    #[test]
    fn unused_cone_disappears() {
        let mut c = Circuit::new();
        let a = c.add_constant(bit_state(true), ConnectionType::Bool);
        let not = c.add_logic(LogicOp::Not);
        c.connect_input(NodePort::new(not, 0), NodePort::new(a, 0)).unwrap();

        cull_unused_nodes(&mut c);
        assert_eq!(c.node_count(), 0);
    }

    #[test]
    fn name_inference_uses_operation_names() {
        let mut c = Circuit::new();
        let a = c.add_constant(bit_state(true), ConnectionType::Bool);
        let named = c.add_signal();
        c.node_mut(named).set_name("enable");
        c.connect_input(NodePort::new(named, 0), NodePort::new(a, 0)).unwrap();
        let not = c.add_logic(LogicOp::Not);
        c.connect_input(NodePort::new(not, 0), NodePort::new(named, 0)).unwrap();
        let out = c.add_signal();
        c.connect_input(NodePort::new(out, 0), NodePort::new(not, 0)).unwrap();

        infer_signal_names(&mut c);
        assert_eq!(c.node(out).name, "enable_not");
        assert!(c.node(out).name_inferred);
    }
}
