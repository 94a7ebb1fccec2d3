use std::fmt;

use crate::node::{NodeId, NodePort};

/// Index into the circuit's group arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub usize);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    /// Hierarchy level that becomes its own entity on export.
    Entity,
    /// Logical grouping within an entity.
    Area,
    /// Special function unit, handled by dedicated export/mapping code.
    Sfu,
}

/// One read port of a memory group with the wiring the optimizer tracks.
#[derive(Debug, Clone)]
pub struct ReadPortInfo {
    pub port: NodeId,
    /// Where consumers read the (possibly registered) read data.
    pub data_output: NodePort,
    /// Register fused into the memory for synchronous reads.
    pub sync_read_reg: Option<NodeId>,
}

/// Metadata attached to the SFU group formed around a memory node.
/// The exporter consumes this to emit block/LUT RAM primitives.
#[derive(Debug, Clone)]
pub struct MemoryGroupInfo {
    pub memory: NodeId,
    pub read_ports: Vec<ReadPortInfo>,
    pub write_ports: Vec<NodeId>,
    /// Sibling group holding generated hazard-resolution logic.
    pub fixup_group: Option<GroupId>,
}

/// Hierarchical container of nodes: models entities, areas, and special
/// function units. Nodes reference their group; groups form a tree.
#[derive(Debug, Clone)]
pub struct NodeGroup {
    pub id: GroupId,
    pub parent: Option<GroupId>,
    pub children: Vec<GroupId>,
    pub group_type: GroupType,
    pub name: String,
    pub instance_name: String,
    pub comment: String,
    pub properties: Vec<(String, String)>,
    pub memory_info: Option<MemoryGroupInfo>,
}

impl NodeGroup {
    pub fn new(id: GroupId, parent: Option<GroupId>, group_type: GroupType) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            group_type,
            name: String::new(),
            instance_name: String::new(),
            comment: String::new(),
            properties: Vec::new(),
            memory_info: None,
        }
    }
}
