use serde::{Deserialize, Serialize};

use crate::models::{ChunkId, NodeId};

/// Health flags of a storage node, set through node maintenance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// The node is banned, its replicas are not to be relied upon.
    #[serde(default)]
    pub banned: bool,
    /// The node is being retired, its replicas are to be migrated off.
    #[serde(default)]
    pub decommissioned: bool,
    /// The node accepts no new replicas, but its existing replicas remain valid.
    #[serde(default)]
    pub write_sessions_disabled: bool,
}

impl NodeHealth {
    /// Check if the node may receive new replicas.
    pub fn accepts_new_replicas(&self) -> bool {
        !self.banned && !self.decommissioned && !self.write_sessions_disabled
    }

    /// Check if replicas stored on the node count towards a chunk's replication factor.
    pub fn holds_safe_replicas(&self) -> bool {
        !self.banned && !self.decommissioned
    }

    /// Check if the node may act as the source of a replication job.
    pub fn can_serve_reads(&self) -> bool {
        !self.banned
    }
}

/// A replica as reported in a node's inventory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoredReplica {
    pub chunk: ChunkId,
    pub part_index: Option<u8>,
}

/// A periodic heartbeat of a storage node, carrying its full replica inventory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub node: NodeId,
    /// The total space of the node, in bytes.
    pub capacity: u64,
    /// The used space of the node, in bytes.
    pub used_space: u64,
    /// All replicas currently stored on the node.
    pub inventory: Vec<StoredReplica>,
}
