//! The replicated state machine of the chunk master.
//!
//! All state which must be identical across master replicas lives in `ChunkMaster`, and it
//! only ever changes by applying `Mutation`s in log order. Applying a mutation is
//! deterministic: any two masters applying the same sequence of mutations to the same
//! snapshot end up in identical states, which in turn yields identical placement decisions.
//! Invalid mutations are rejected before any state is touched.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::chunks::{ChunkCreateSpec, ChunkRegistry, PolicyUpdate, ReplicaLoss};
use crate::config::validate_throttle_limit;
use crate::error::{AppError, AppResult, ShutdownError, ShutdownResult};
use crate::models::{ChunkId, NodeHealth, NodeHeartbeat, NodeId, ReplicationPolicy, StoredReplica, ROOT_USER};
use crate::nodes::NodeTracker;
use crate::requisition::RequisitionRegistry;
use crate::ring::{RingDelta, RingSnapshot, TokenRing};

/// A change to the replicated state of the master.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Mutation {
    /// Register a storage node, adding it to the token ring.
    RegisterNode {
        address: String,
        capacity: u64,
        tokens_per_node: u32,
        bucket_count: u32,
    },
    /// Remove a storage node, dropping all of its replicas & tokens.
    RemoveNode { node: NodeId },
    SetNodeHealth { node: NodeId, health: NodeHealth },
    /// A heartbeat of a node, carrying its full inventory.
    NodeHeartbeat { heartbeat: NodeHeartbeat },
    /// A node has stopped sending heartbeats.
    NodeOffline { node: NodeId },
    CreateChunk { id: ChunkId, spec: ChunkCreateSpec },
    RemoveChunk { id: ChunkId },
    AttachOwner { id: ChunkId, account: String, policy: ReplicationPolicy },
    DetachOwner { id: ChunkId, account: String },
    MergeOwner { id: ChunkId, old_account: String, new_account: String },
    UpdatePolicy { id: ChunkId, update: PolicyUpdate },
    /// Rebalance the token ring using the given parameters.
    RebalanceTokens { tokens_per_node: u32, bucket_count: u32 },
    /// Set or clear the request bytes throttle override of a user.
    SetUserThrottle { user: String, limit: Option<f64> },
}

impl Mutation {
    /// The kind of this mutation as a static label.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::RegisterNode { .. } => "register_node",
            Self::RemoveNode { .. } => "remove_node",
            Self::SetNodeHealth { .. } => "set_node_health",
            Self::NodeHeartbeat { .. } => "node_heartbeat",
            Self::NodeOffline { .. } => "node_offline",
            Self::CreateChunk { .. } => "create_chunk",
            Self::RemoveChunk { .. } => "remove_chunk",
            Self::AttachOwner { .. } => "attach_owner",
            Self::DetachOwner { .. } => "detach_owner",
            Self::MergeOwner { .. } => "merge_owner",
            Self::UpdatePolicy { .. } => "update_policy",
            Self::RebalanceTokens { .. } => "rebalance_tokens",
            Self::SetUserThrottle { .. } => "set_user_throttle",
        }
    }
}

/// The observable effects of an applied mutation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationOutcome {
    /// Chunks which need to be re-evaluated.
    pub touched: BTreeSet<ChunkId>,
    /// The node registered by the mutation.
    pub node: Option<NodeId>,
    /// Replicas newly reported by a node.
    pub reported: Vec<(ChunkId, NodeId)>,
    /// The ring change produced by a rebalance.
    pub ring_delta: Option<RingDelta>,
    /// The throttle override changed by the mutation.
    pub throttle: Option<(String, Option<f64>)>,
}

/// The persisted state of the master.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MasterSnapshot {
    /// The number of mutations applied to produce this snapshot.
    pub applied: u64,
    pub requisitions: RequisitionRegistry,
    pub ring: RingSnapshot,
    pub nodes: NodeTracker,
    pub chunks: ChunkRegistry,
    pub throttle_overrides: BTreeMap<String, f64>,
}

/// The replicated state of the chunk master.
#[derive(Clone, Debug, Default)]
pub struct ChunkMaster {
    applied: u64,
    requisitions: RequisitionRegistry,
    ring: TokenRing,
    nodes: NodeTracker,
    chunks: ChunkRegistry,
    throttle_overrides: BTreeMap<String, f64>,
}

impl ChunkMaster {
    /// The number of mutations applied so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn requisitions(&self) -> &RequisitionRegistry {
        &self.requisitions
    }

    pub fn ring(&self) -> &TokenRing {
        &self.ring
    }

    pub fn nodes(&self) -> &NodeTracker {
        &self.nodes
    }

    pub fn chunks(&self) -> &ChunkRegistry {
        &self.chunks
    }

    pub fn throttle_overrides(&self) -> &BTreeMap<String, f64> {
        &self.throttle_overrides
    }

    /// Apply the given mutation.
    #[tracing::instrument(level = "trace", skip(self, mutation), fields(kind = mutation.kind_label()))]
    pub fn apply(&mut self, mutation: Mutation) -> AppResult<MutationOutcome> {
        let mut outcome = MutationOutcome::default();
        match mutation {
            Mutation::RegisterNode {
                address,
                capacity,
                tokens_per_node,
                bucket_count,
            } => {
                if address.is_empty() {
                    return Err(AppError::InvalidInput("node address must not be empty".into()));
                }
                let node = self.nodes.register(&address);
                self.nodes.get_mut(node)?.capacity = capacity;
                self.ring.register_node(node, capacity, tokens_per_node, bucket_count);
                outcome.node = Some(node);
            }
            Mutation::RemoveNode { node } => {
                let record = self.nodes.get(node)?;
                if record.online {
                    return Err(AppError::InvalidInput(format!("node {} must be offline to be removed", node)));
                }
                let known: Vec<_> = record.replicas.iter().chain(record.destroyed_replicas.iter()).copied().collect();
                for replica in known {
                    self.drop_replica(node, replica, &mut outcome)?;
                }
                self.nodes.remove(node);
                self.ring.unregister_node(node);
            }
            Mutation::SetNodeHealth { node, health } => {
                self.nodes.set_health(node, health)?;
                self.touch_node(node, &mut outcome)?;
            }
            Mutation::NodeHeartbeat { heartbeat } => self.apply_heartbeat(heartbeat, &mut outcome)?,
            Mutation::NodeOffline { node } => {
                self.nodes.get_mut(node)?.online = false;
                self.touch_node(node, &mut outcome)?;
            }
            Mutation::CreateChunk { id, spec } => {
                self.chunks.create(id, spec, &mut self.requisitions)?;
                outcome.touched.insert(id);
            }
            Mutation::RemoveChunk { id } => {
                self.chunks.remove(id, &mut self.requisitions)?;
                self.nodes.destroy_chunk_replicas(id);
                outcome.touched.insert(id);
            }
            Mutation::AttachOwner { id, account, policy } => {
                self.chunks.attach_owner(id, &account, policy, &mut self.requisitions)?;
            }
            Mutation::DetachOwner { id, account } => {
                self.chunks.detach_owner(id, &account, &mut self.requisitions)?;
            }
            Mutation::MergeOwner { id, old_account, new_account } => {
                self.chunks.merge_owner(id, &old_account, &new_account, &mut self.requisitions)?;
            }
            Mutation::UpdatePolicy { id, update } => {
                self.chunks.update_policy(id, update, &mut self.requisitions)?;
            }
            Mutation::RebalanceTokens {
                tokens_per_node,
                bucket_count,
            } => {
                if tokens_per_node == 0 || bucket_count == 0 {
                    return Err(AppError::InvalidInput("token counts must be positive".into()));
                }
                outcome.ring_delta = Some(self.ring.rebalance(tokens_per_node, bucket_count));
            }
            Mutation::SetUserThrottle { user, limit } => {
                if user == ROOT_USER {
                    return Err(AppError::InvalidInput(format!("user {} can not be throttled", ROOT_USER)));
                }
                if user.is_empty() {
                    return Err(AppError::InvalidInput("user must not be empty".into()));
                }
                match limit {
                    Some(limit) => {
                        validate_throttle_limit(limit)?;
                        self.throttle_overrides.insert(user.clone(), limit);
                    }
                    None => {
                        self.throttle_overrides.remove(&user);
                    }
                }
                outcome.throttle = Some((user, limit));
            }
        }
        outcome.touched.extend(self.requisitions.take_updates());
        self.applied += 1;
        Ok(outcome)
    }

    /// Merge a node heartbeat into the master's view of the node.
    fn apply_heartbeat(&mut self, heartbeat: NodeHeartbeat, outcome: &mut MutationOutcome) -> AppResult<()> {
        let id = heartbeat.node;
        let diff = self.nodes.diff_inventory(id, &heartbeat.inventory)?;
        let node = self.nodes.get_mut(id)?;
        let came_online = !node.online;
        if came_online {
            tracing::info!(node = %id, "node is online");
        }
        node.online = true;
        node.capacity = heartbeat.capacity;
        node.used_space = heartbeat.used_space;
        self.ring.set_weight(id, heartbeat.capacity);

        for replica in diff.added {
            outcome.touched.insert(replica.chunk);
            let accepted = self.chunks.is_live(replica.chunk) && self.chunks.report_replica(replica.chunk, id, replica.part_index).is_ok();
            let node = self.nodes.get_mut(id)?;
            if accepted {
                node.replicas.insert(replica);
                outcome.reported.push((replica.chunk, id));
            } else {
                tracing::debug!(node = %id, chunk = %replica.chunk, "node reported a destroyed replica");
                node.destroyed_replicas.insert(replica);
            }
        }
        for replica in diff.lost {
            self.drop_replica(id, replica, outcome)?;
        }
        if came_online {
            self.touch_node(id, outcome)?;
        }
        Ok(())
    }

    /// Drop a replica from a node, live or destroyed.
    fn drop_replica(&mut self, id: NodeId, replica: StoredReplica, outcome: &mut MutationOutcome) -> AppResult<()> {
        let node = self.nodes.get_mut(id)?;
        let live = node.replicas.remove(&replica);
        let destroyed = node.destroyed_replicas.remove(&replica);
        if !live && !destroyed {
            return Ok(());
        }
        outcome.touched.insert(replica.chunk);
        if self.chunks.get(replica.chunk).is_err() {
            return Ok(());
        }
        if let ReplicaLoss::LastReplica = self.chunks.report_replica_lost(replica.chunk, id, replica.part_index)? {
            tracing::warn!(chunk = %replica.chunk, node = %id, "last replica of chunk lost");
        }
        Ok(())
    }

    /// Mark all chunks stored on the given node as touched.
    fn touch_node(&self, id: NodeId, outcome: &mut MutationOutcome) -> AppResult<()> {
        let node = self.nodes.get(id)?;
        outcome
            .touched
            .extend(node.replicas.iter().chain(node.destroyed_replicas.iter()).map(|replica| replica.chunk));
        Ok(())
    }

    /// Build the persisted state of this master.
    pub fn snapshot(&self) -> MasterSnapshot {
        MasterSnapshot {
            applied: self.applied,
            requisitions: self.requisitions.clone(),
            ring: self.ring.snapshot(),
            nodes: self.nodes.clone(),
            chunks: self.chunks.clone(),
            throttle_overrides: self.throttle_overrides.clone(),
        }
    }

    /// Restore a master from its persisted state.
    ///
    /// Any inconsistency in the restored state is fatal, as the state could not reproduce the
    /// placement decisions of other masters.
    pub fn restore(snapshot: MasterSnapshot) -> ShutdownResult<Self> {
        let MasterSnapshot {
            applied,
            mut requisitions,
            ring,
            nodes,
            mut chunks,
            throttle_overrides,
        } = snapshot;
        requisitions.rebuild_index().context("error rebuilding requisition registry")?;
        requisitions
            .validate_ref_counts(&chunks.requisition_references())
            .context("requisition registry is inconsistent with chunk registry")?;
        let ring = TokenRing::restore(ring).context("error restoring token ring")?;
        if let Some(node) = nodes.iter().find(|node| !ring.contains(node.id)) {
            return Err(ShutdownError(anyhow::anyhow!("node {} is missing from the token ring", node.id)));
        }
        if let Some(user) = throttle_overrides.keys().find(|user| *user == ROOT_USER) {
            return Err(ShutdownError(anyhow::anyhow!("throttle override held for {}", user)));
        }
        validate_replica_index(&nodes, &chunks).context("node replica index is inconsistent with chunk registry")?;
        chunks.rebuild();
        Ok(Self {
            applied,
            requisitions,
            ring,
            nodes,
            chunks,
            throttle_overrides,
        })
    }
}

/// Validate that the live replicas of all nodes match the stored replicas of all chunks.
fn validate_replica_index(nodes: &NodeTracker, chunks: &ChunkRegistry) -> anyhow::Result<()> {
    for node in nodes.iter() {
        for replica in node.replicas.iter() {
            let chunk = chunks.get(replica.chunk).with_context(|| format!("{} holds a replica of an unknown chunk", node.id))?;
            if !chunk.stored_replicas.iter().any(|stored| stored.node == node.id && stored.part_index == replica.part_index) {
                bail!("{} holds a replica unknown to chunk {}", node.id, chunk.id);
            }
        }
    }
    for chunk in chunks.iter().filter(|chunk| !chunk.removed) {
        for stored in chunk.stored_replicas.iter() {
            let known = nodes
                .get(stored.node)
                .map(|node| node.replicas.contains(&StoredReplica { chunk: chunk.id, part_index: stored.part_index }))
                .unwrap_or(false);
            if !known {
                bail!("chunk {} records a replica on {} which the node does not hold", chunk.id, stored.node);
            }
        }
    }
    Ok(())
}
