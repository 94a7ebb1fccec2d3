use log::debug;

use crate::circuit::Circuit;
use crate::errors::Result;

pub mod memory;
mod pass_constants;
mod pass_muxes;
mod pass_signals;
pub mod retiming;

pub use pass_constants::propagate_constants;
pub use pass_muxes::{
    cull_mux_condition_negations, fold_register_mux_enable_loops, merge_muxes,
    remove_const_select_muxes, remove_irrelevant_muxes, remove_noop_rewires,
};
pub use pass_signals::{
    cull_orphaned_signal_nodes, cull_sequentially_duplicated_signal_nodes,
    cull_unnamed_signal_nodes, cull_unused_nodes, ensure_signal_node_placement,
    infer_signal_names,
};

/// Intentionally does nothing. The original carries this pass disabled and
/// its intent is unresolved, so it stays a documented no-op.
pub fn remove_false_loops(_circuit: &mut Circuit) {}

/// Runs the optimization pipeline at the given level (0-3). Every pass
/// preserves observable behavior at pins and named signals; level 3 also
/// forms memory groups and materializes their hazard-resolution logic.
pub fn optimize(circuit: &mut Circuit, level: usize) -> Result<()> {
    match level {
        0 => {}
        1 => {
            cull_orphaned_signal_nodes(circuit);
        }
        2 => {
            cull_orphaned_signal_nodes(circuit);
            cull_unnamed_signal_nodes(circuit);
            cull_unused_nodes(circuit);
        }
        _ => {
            propagate_constants(circuit);
            cull_orphaned_signal_nodes(circuit);
            cull_unnamed_signal_nodes(circuit);
            cull_sequentially_duplicated_signal_nodes(circuit);
            merge_muxes(circuit);
            remove_irrelevant_muxes(circuit);
            cull_mux_condition_negations(circuit);
            remove_noop_rewires(circuit);
            fold_register_mux_enable_loops(circuit);
            remove_const_select_muxes(circuit);
            propagate_constants(circuit); // again, now that muxes are gone
            cull_unused_nodes(circuit);
            ensure_signal_node_placement(circuit);

            memory::find_memory_groups(circuit)?;
            memory::build_explicit_memory_circuitry(circuit)?;
            cull_unnamed_signal_nodes(circuit);
            cull_unused_nodes(circuit); // memory extraction may have retimed registers

            remove_false_loops(circuit);
            infer_signal_names(circuit);
        }
    }
    circuit.recur_infer_instance_names();
    debug!("optimize(level={}) done, {} nodes live", level, circuit.node_count());
    Ok(())
}
