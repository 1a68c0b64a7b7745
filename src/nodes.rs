//! Storage node tracking.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::{ChunkId, ChunkReplica, NodeHealth, NodeId, StoredReplica};

/// A storage node known to the master.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// The network address of the node.
    pub address: String,
    pub health: NodeHealth,
    /// Whether the node is currently sending heartbeats.
    pub online: bool,
    /// The total space of the node, in bytes.
    pub capacity: u64,
    /// The used space of the node, in bytes.
    pub used_space: u64,
    /// Replicas of live chunks stored on this node.
    pub replicas: BTreeSet<StoredReplica>,
    /// Replicas stored on this node which belong to removed or unknown chunks.
    pub destroyed_replicas: BTreeSet<StoredReplica>,
}

impl Node {
    fn new(id: NodeId, address: String) -> Self {
        Self {
            id,
            address,
            health: NodeHealth::default(),
            online: false,
            capacity: 0,
            used_space: 0,
            replicas: Default::default(),
            destroyed_replicas: Default::default(),
        }
    }

    /// The free space of the node, in bytes.
    pub fn free_space(&self) -> u64 {
        self.capacity.saturating_sub(self.used_space)
    }

    /// Check if the node may receive new replicas.
    pub fn is_writable(&self) -> bool {
        self.online && self.health.accepts_new_replicas()
    }

    /// Check if replicas on this node count towards a chunk's replication factor.
    pub fn is_safe(&self) -> bool {
        self.online && self.health.holds_safe_replicas()
    }

    /// Check if replicas on this node can be read, and thus used as a copy source.
    pub fn is_readable(&self) -> bool {
        self.online && self.health.can_serve_reads()
    }

    /// Check if this node stores any part of the given chunk.
    pub fn holds_chunk(&self, chunk: ChunkId) -> bool {
        self.replicas.range(chunk_range(chunk)).next().is_some()
    }
}

/// The range of stored replicas belonging to the given chunk.
fn chunk_range(chunk: ChunkId) -> std::ops::RangeInclusive<StoredReplica> {
    StoredReplica { chunk, part_index: None }..=StoredReplica { chunk, part_index: Some(u8::MAX) }
}

/// The difference between a node's reported inventory and the master's view of it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InventoryDiff {
    /// Replicas reported by the node which the master did not know about.
    pub added: Vec<StoredReplica>,
    /// Replicas the master knew about which the node no longer reports.
    pub lost: Vec<StoredReplica>,
}

/// Tracker of all storage nodes known to the master.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeTracker {
    next_id: u32,
    #[serde(with = "crate::utils::pairs")]
    nodes: BTreeMap<NodeId, Node>,
}

impl NodeTracker {
    /// Register a node by address, returning its ID.
    ///
    /// Registering a known address returns the ID already assigned to it.
    pub fn register(&mut self, address: &str) -> NodeId {
        if let Some(node) = self.nodes.values().find(|node| node.address == address) {
            return node.id;
        }
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, Node::new(id, address.into()));
        tracing::info!(node = %id, address, "storage node registered");
        id
    }

    pub fn get(&self, id: NodeId) -> AppResult<&Node> {
        self.nodes.get(&id).ok_or(AppError::NodeNotFound(id))
    }

    pub fn get_mut(&mut self, id: NodeId) -> AppResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AppError::NodeNotFound(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Forget a node entirely.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        tracing::info!(node = %id, address = %node.address, "storage node removed");
        Some(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The number of online nodes which are not banned.
    pub fn online_node_count(&self) -> usize {
        self.nodes.values().filter(|node| node.is_readable()).count()
    }

    /// Set the health flags of a node.
    pub fn set_health(&mut self, id: NodeId, health: NodeHealth) -> AppResult<()> {
        let node = self.get_mut(id)?;
        if node.health != health {
            tracing::info!(node = %id, ?health, "node health updated");
        }
        node.health = health;
        Ok(())
    }

    /// Compute the difference between the given inventory and the known replicas of a node.
    ///
    /// Both live and destroyed replicas are considered known.
    pub fn diff_inventory(&self, id: NodeId, inventory: &[StoredReplica]) -> AppResult<InventoryDiff> {
        let node = self.get(id)?;
        let reported: BTreeSet<_> = inventory.iter().copied().collect();
        let added = reported
            .iter()
            .filter(|replica| !node.replicas.contains(replica) && !node.destroyed_replicas.contains(replica))
            .copied()
            .collect();
        let lost = node
            .replicas
            .iter()
            .chain(node.destroyed_replicas.iter())
            .filter(|replica| !reported.contains(replica))
            .copied()
            .collect();
        Ok(InventoryDiff { added, lost })
    }

    /// Move all replicas of the given chunk into the destroyed replica sets of their nodes.
    pub fn destroy_chunk_replicas(&mut self, chunk: ChunkId) {
        for node in self.nodes.values_mut() {
            let replicas: Vec<_> = node.replicas.range(chunk_range(chunk)).copied().collect();
            for replica in replicas {
                node.replicas.remove(&replica);
                node.destroyed_replicas.insert(replica);
            }
        }
    }

    /// All destroyed replicas of the given chunk, across all nodes.
    pub fn destroyed_replicas_of(&self, chunk: ChunkId) -> Vec<ChunkReplica> {
        self.nodes
            .values()
            .flat_map(|node| {
                node.destroyed_replicas
                    .range(chunk_range(chunk))
                    .map(move |replica| ChunkReplica::new(node.id, replica.part_index))
            })
            .collect()
    }

    /// All chunks having destroyed replicas on any node.
    pub fn chunks_with_destroyed_replicas(&self) -> BTreeSet<ChunkId> {
        self.nodes
            .values()
            .flat_map(|node| node.destroyed_replicas.iter().map(|replica| replica.chunk))
            .collect()
    }
}
