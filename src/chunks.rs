//! Chunk registry.
//!
//! The registry holds the canonical metadata of every chunk. Each owning account of a chunk
//! holds a local requisition describing the policy it requires, and the chunk holds the
//! aggregated requisition of all of its live owners. All requisition references are
//! acquired & released through the `RequisitionRegistry`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::histogram::WeightHistograms;
use crate::models::{ChunkId, ChunkReplica, ChunkStatistics, ErasureCodec, NodeId, ReplicationPolicy};
use crate::requisition::{RequisitionEntry, RequisitionIndex, RequisitionRegistry};

/// An account owning a chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOwner {
    /// The policy this owner requires of the chunk.
    pub policy: ReplicationPolicy,
    /// The local requisition of this owner.
    pub requisition: RequisitionIndex,
    /// The number of references this owner holds to the chunk.
    pub holders: u32,
}

/// The canonical metadata of a chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub codec: ErasureCodec,
    /// The medium on which the replicas of this chunk are stored.
    pub medium: String,
    /// All owners of this chunk, by account.
    pub owners: BTreeMap<String, ChunkOwner>,
    /// The aggregated requisition of all owners.
    pub requisition: RequisitionIndex,
    /// The currently stored replicas, ordered by node & part.
    pub stored_replicas: Vec<ChunkReplica>,
    pub vital: bool,
    /// Set once the chunk has ever been allowed to lose its data without alarm.
    pub historically_non_vital: bool,
    /// The placement hash of chunks which opted into consistent placement at creation.
    pub consistent_placement_hash: Option<u64>,
    /// The chunk has been removed, and its replicas are being reclaimed.
    pub removed: bool,
    pub statistics: ChunkStatistics,
}

impl Chunk {
    /// All entries owed by the live owners of this chunk.
    fn live_entries(&self) -> Vec<RequisitionEntry> {
        self.owners
            .iter()
            .map(|(account, owner)| RequisitionEntry::new(account.as_str(), &owner.policy))
            .collect()
    }

    /// The highest replication factor required by any owner on this chunk's medium.
    pub fn replication_factor(&self) -> u8 {
        self.owners
            .values()
            .filter(|owner| owner.policy.medium == self.medium)
            .map(|owner| owner.policy.replication_factor)
            .max()
            .unwrap_or(0)
    }

    /// Check if only data parts of this erasure chunk are required.
    pub fn data_parts_only(&self) -> bool {
        self.codec.is_erasure() && !self.owners.is_empty() && self.owners.values().all(|owner| owner.policy.data_parts_only)
    }

    /// The number of replicas to store, or the number of parts for erasure chunks.
    ///
    /// Replicated chunks never ask for more than the given max replication factor of their medium.
    pub fn desired_replica_count(&self, max_replication_factor: u8) -> usize {
        if self.data_parts_only() {
            self.codec.data_part_count() as usize
        } else if self.codec.is_erasure() {
            self.codec.total_part_count() as usize
        } else {
            self.replication_factor().min(max_replication_factor) as usize
        }
    }

    /// The nodes storing any replica of this chunk.
    pub fn replica_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.stored_replicas.iter().map(|replica| replica.node)
    }

    /// Check if the loss of all replicas of this chunk is a vital data loss.
    pub fn is_vital_loss(&self) -> bool {
        self.vital && !self.historically_non_vital
    }

    /// Mark the chunk historically non-vital once its data may be lost without alarm.
    fn update_historical_vitality(&mut self) {
        if self.historically_non_vital {
            return;
        }
        if !self.vital || (!self.codec.is_erasure() && self.replication_factor() <= 1) {
            tracing::debug!(chunk = %self.id, "chunk is now historically non-vital");
            self.historically_non_vital = true;
        }
    }
}

/// The parameters of a chunk to create.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkCreateSpec {
    #[serde(default)]
    pub codec: ErasureCodec,
    /// The account on behalf of which the chunk is written.
    pub account: String,
    pub policy: ReplicationPolicy,
    #[serde(default = "default_vital")]
    pub vital: bool,
    /// The consistent placement hash, present if the chunk opts into consistent placement.
    #[serde(default)]
    pub consistent_placement_hash: Option<u64>,
    #[serde(default)]
    pub statistics: ChunkStatistics,
}

pub(crate) fn default_vital() -> bool {
    true
}

/// An update to the policy of a chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum PolicyUpdate {
    /// Set the replication factor required by all owners.
    ReplicationFactor(u8),
    /// Change the erasure codec, only possible while no replicas are stored.
    Codec(ErasureCodec),
    /// Set the vitality of the chunk.
    Vital(bool),
}

/// The outcome of a replica being reported lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaLoss {
    /// The replica was not known.
    Unknown,
    /// The replica was dropped, and other replicas remain.
    Dropped,
    /// The last replica of the chunk was dropped.
    LastReplica,
    /// The last replica of a removed chunk was reclaimed, and the chunk record was dropped.
    Reclaimed,
}

/// The registry of all chunks.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkRegistry {
    #[serde(with = "crate::utils::pairs")]
    chunks: BTreeMap<ChunkId, Chunk>,
    #[serde(skip)]
    histograms: WeightHistograms,
}

impl ChunkRegistry {
    pub fn get(&self, id: ChunkId) -> AppResult<&Chunk> {
        self.chunks.get(&id).ok_or(AppError::ChunkNotFound(id))
    }

    fn get_mut(&mut self, id: ChunkId) -> AppResult<&mut Chunk> {
        self.chunks.get_mut(&id).ok_or(AppError::ChunkNotFound(id))
    }

    /// Get a live chunk, rejecting removed chunks.
    fn get_live_mut(&mut self, id: ChunkId) -> AppResult<&mut Chunk> {
        let chunk = self.get_mut(id)?;
        if chunk.removed {
            return Err(AppError::InvalidInput(format!("chunk {} has been removed", id)));
        }
        Ok(chunk)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.chunks.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn histograms(&self) -> &WeightHistograms {
        &self.histograms
    }

    /// Check if the given chunk exists and is not removed.
    pub fn is_live(&self, id: ChunkId) -> bool {
        self.chunks.get(&id).map(|chunk| !chunk.removed).unwrap_or(false)
    }

    /// Create a new chunk.
    #[tracing::instrument(level = "debug", skip(self, spec, requisitions))]
    pub fn create(&mut self, id: ChunkId, spec: ChunkCreateSpec, requisitions: &mut RequisitionRegistry) -> AppResult<&Chunk> {
        if self.chunks.contains_key(&id) {
            return Err(AppError::InvalidInput(format!("chunk {} already exists", id)));
        }
        if spec.account.is_empty() {
            return Err(AppError::InvalidInput("chunk owner account must not be empty".into()));
        }
        if spec.codec.is_erasure() && spec.policy.replication_factor != 1 {
            return Err(AppError::InvalidInput(format!(
                "erasure chunks store a single replica of each part, got replication factor {}",
                spec.policy.replication_factor
            )));
        }
        if spec.policy.replication_factor == 0 {
            return Err(AppError::InvalidInput("replication factor must be positive".into()));
        }
        spec.codec.validate().map_err(AppError::InvalidInput)?;

        let entry = RequisitionEntry::new(spec.account.as_str(), &spec.policy);
        let local = requisitions.intern(vec![entry.clone()], spec.vital);
        let aggregated = requisitions.intern(vec![entry], spec.vital);
        let mut owners = BTreeMap::new();
        owners.insert(
            spec.account,
            ChunkOwner {
                policy: spec.policy.clone(),
                requisition: local,
                holders: 1,
            },
        );
        let mut chunk = Chunk {
            id,
            codec: spec.codec,
            medium: spec.policy.medium,
            owners,
            requisition: aggregated,
            stored_replicas: vec![],
            vital: spec.vital,
            historically_non_vital: false,
            consistent_placement_hash: spec.consistent_placement_hash,
            removed: false,
            statistics: spec.statistics,
        };
        chunk.update_historical_vitality();
        self.histograms.add(&chunk.statistics);
        metrics::increment_gauge!(METRIC_CHUNK_COUNT, 1.0);
        Ok(self.chunks.entry(id).or_insert(chunk))
    }

    /// Update the policy of a chunk.
    #[tracing::instrument(level = "debug", skip(self, requisitions))]
    pub fn update_policy(&mut self, id: ChunkId, update: PolicyUpdate, requisitions: &mut RequisitionRegistry) -> AppResult<()> {
        let chunk = self.get_live_mut(id)?;
        match update {
            PolicyUpdate::ReplicationFactor(rf) => {
                if rf == 0 {
                    return Err(AppError::InvalidInput("replication factor must be positive".into()));
                }
                if chunk.codec.is_erasure() && rf != 1 {
                    return Err(AppError::InvalidInput(format!("erasure chunk {} can not be replicated", id)));
                }
                for owner in chunk.owners.values_mut() {
                    owner.policy.replication_factor = rf;
                }
            }
            PolicyUpdate::Codec(codec) => {
                codec.validate().map_err(AppError::InvalidInput)?;
                if !chunk.stored_replicas.is_empty() && codec != chunk.codec {
                    return Err(AppError::InvalidInput(format!(
                        "codec of chunk {} can not change while replicas are stored",
                        id
                    )));
                }
                if codec.is_erasure() && chunk.replication_factor() != 1 {
                    return Err(AppError::InvalidInput(format!(
                        "chunk {} must have replication factor 1 to use erasure codec {}",
                        id, codec
                    )));
                }
                chunk.codec = codec;
            }
            PolicyUpdate::Vital(vital) => chunk.vital = vital,
        }
        Self::refresh_requisitions(chunk, requisitions)?;
        chunk.update_historical_vitality();
        Ok(())
    }

    /// Attach an owner to a chunk, or add a reference to an existing owner.
    #[tracing::instrument(level = "debug", skip(self, requisitions))]
    pub fn attach_owner(
        &mut self, id: ChunkId, account: &str, policy: ReplicationPolicy, requisitions: &mut RequisitionRegistry,
    ) -> AppResult<()> {
        if account.is_empty() {
            return Err(AppError::InvalidInput("chunk owner account must not be empty".into()));
        }
        let chunk = self.get_live_mut(id)?;
        if chunk.codec.is_erasure() && policy.replication_factor != 1 {
            return Err(AppError::InvalidInput(format!("erasure chunk {} can not be replicated", id)));
        }
        if policy.replication_factor == 0 {
            return Err(AppError::InvalidInput("replication factor must be positive".into()));
        }
        if let Some(owner) = chunk.owners.get_mut(account) {
            owner.holders += 1;
            return Ok(());
        }
        let local = requisitions.intern(vec![RequisitionEntry::new(account, &policy)], chunk.vital);
        chunk.owners.insert(
            account.into(),
            ChunkOwner {
                policy,
                requisition: local,
                holders: 1,
            },
        );
        Self::update_aggregated(chunk, requisitions)?;
        chunk.update_historical_vitality();
        Ok(())
    }

    /// Drop a reference of an owner to a chunk, detaching the owner at its last reference.
    #[tracing::instrument(level = "debug", skip(self, requisitions))]
    pub fn detach_owner(&mut self, id: ChunkId, account: &str, requisitions: &mut RequisitionRegistry) -> AppResult<()> {
        let chunk = self.get_live_mut(id)?;
        let owner_count = chunk.owners.len();
        let owner = chunk
            .owners
            .get_mut(account)
            .ok_or_else(|| AppError::InvalidInput(format!("account {} does not own chunk {}", account, id)))?;
        if owner.holders > 1 {
            owner.holders -= 1;
            return Ok(());
        }
        if owner_count == 1 {
            return Err(AppError::InvalidInput(format!(
                "can not detach the last owner of chunk {}, remove the chunk instead",
                id
            )));
        }
        let local = owner.requisition;
        chunk.owners.remove(account);
        requisitions.release(local).map_err(AppError::Ise)?;
        Self::update_aggregated(chunk, requisitions)?;
        chunk.update_historical_vitality();
        Ok(())
    }

    /// Merge the ownership of `old_account` into `new_account`.
    ///
    /// The new owner is granted the policy of the old owner, raising its replication factor
    /// if it already owns the chunk. The old owner keeps its references until they are
    /// detached, at which point its entries leave the aggregated requisition.
    #[tracing::instrument(level = "debug", skip(self, requisitions))]
    pub fn merge_owner(&mut self, id: ChunkId, old_account: &str, new_account: &str, requisitions: &mut RequisitionRegistry) -> AppResult<()> {
        if new_account.is_empty() {
            return Err(AppError::InvalidInput("chunk owner account must not be empty".into()));
        }
        let chunk = self.get_live_mut(id)?;
        let policy = chunk
            .owners
            .get(old_account)
            .map(|owner| owner.policy.clone())
            .ok_or_else(|| AppError::InvalidInput(format!("account {} does not own chunk {}", old_account, id)))?;
        if old_account == new_account {
            return Ok(());
        }
        match chunk.owners.get_mut(new_account) {
            Some(owner) => {
                owner.holders += 1;
                if owner.policy.medium == policy.medium && owner.policy.replication_factor < policy.replication_factor {
                    owner.policy.replication_factor = policy.replication_factor;
                    let next = requisitions.intern(vec![RequisitionEntry::new(new_account, &owner.policy)], chunk.vital);
                    requisitions.release(owner.requisition).map_err(AppError::Ise)?;
                    owner.requisition = next;
                }
            }
            None => {
                let local = requisitions.intern(vec![RequisitionEntry::new(new_account, &policy)], chunk.vital);
                chunk.owners.insert(
                    new_account.into(),
                    ChunkOwner {
                        policy,
                        requisition: local,
                        holders: 1,
                    },
                );
            }
        }
        Self::update_aggregated(chunk, requisitions)?;
        Ok(())
    }

    /// Logically remove a chunk.
    ///
    /// All requisitions of the chunk are released. The record is retained until all of its
    /// replicas are reclaimed.
    #[tracing::instrument(level = "debug", skip(self, requisitions))]
    pub fn remove(&mut self, id: ChunkId, requisitions: &mut RequisitionRegistry) -> AppResult<Vec<ChunkReplica>> {
        let chunk = self.get_live_mut(id)?;
        chunk.removed = true;
        for owner in chunk.owners.values() {
            requisitions.release(owner.requisition).map_err(AppError::Ise)?;
        }
        requisitions.release(chunk.requisition).map_err(AppError::Ise)?;
        chunk.owners.clear();
        let replicas = chunk.stored_replicas.clone();
        let stats = chunk.statistics;
        if replicas.is_empty() {
            self.chunks.remove(&id);
        }
        self.histograms.remove(&stats);
        metrics::decrement_gauge!(METRIC_CHUNK_COUNT, 1.0);
        Ok(replicas)
    }

    /// Record a replica reported by a node.
    ///
    /// Returns `false` if the replica was already known.
    pub fn report_replica(&mut self, id: ChunkId, node: NodeId, part_index: Option<u8>) -> AppResult<bool> {
        let chunk = self.get_mut(id)?;
        if chunk.codec.is_erasure() {
            match part_index {
                Some(idx) if idx < chunk.codec.total_part_count() => (),
                _ => {
                    return Err(AppError::InvalidInput(format!(
                        "invalid part index {:?} reported for erasure chunk {}",
                        part_index, id
                    )))
                }
            }
        } else if part_index.is_some() {
            return Err(AppError::InvalidInput(format!("part index reported for regular chunk {}", id)));
        }
        let replica = ChunkReplica::new(node, part_index);
        match chunk.stored_replicas.binary_search(&replica) {
            Ok(_) => Ok(false),
            Err(pos) => {
                chunk.stored_replicas.insert(pos, replica);
                Ok(true)
            }
        }
    }

    /// Record the loss of a replica reported by a node.
    pub fn report_replica_lost(&mut self, id: ChunkId, node: NodeId, part_index: Option<u8>) -> AppResult<ReplicaLoss> {
        let chunk = self.get_mut(id)?;
        let replica = ChunkReplica::new(node, part_index);
        let pos = match chunk.stored_replicas.binary_search(&replica) {
            Ok(pos) => pos,
            Err(_) => return Ok(ReplicaLoss::Unknown),
        };
        chunk.stored_replicas.remove(pos);
        if !chunk.stored_replicas.is_empty() {
            return Ok(ReplicaLoss::Dropped);
        }
        if chunk.removed {
            self.chunks.remove(&id);
            tracing::debug!(chunk = %id, "removed chunk fully reclaimed");
            return Ok(ReplicaLoss::Reclaimed);
        }
        Ok(ReplicaLoss::LastReplica)
    }

    /// Count the requisition references held by all chunks & their owners.
    pub fn requisition_references(&self) -> BTreeMap<RequisitionIndex, u32> {
        let mut refs = BTreeMap::new();
        for chunk in self.chunks.values().filter(|chunk| !chunk.removed) {
            *refs.entry(chunk.requisition).or_insert(0) += 1;
            for owner in chunk.owners.values() {
                *refs.entry(owner.requisition).or_insert(0) += 1;
            }
        }
        refs
    }

    /// Rebuild derived state after deserialization.
    pub fn rebuild(&mut self) {
        let mut histograms = WeightHistograms::default();
        let mut live = 0;
        for chunk in self.chunks.values().filter(|chunk| !chunk.removed) {
            histograms.add(&chunk.statistics);
            live += 1;
        }
        self.histograms = histograms;
        metrics::gauge!(METRIC_CHUNK_COUNT, live as f64);
    }

    /// Re-intern the local requisitions of all owners, then the aggregated requisition.
    fn refresh_requisitions(chunk: &mut Chunk, requisitions: &mut RequisitionRegistry) -> AppResult<()> {
        for (account, owner) in chunk.owners.iter_mut() {
            let next = requisitions.intern(vec![RequisitionEntry::new(account.as_str(), &owner.policy)], chunk.vital);
            requisitions.release(owner.requisition).map_err(AppError::Ise)?;
            owner.requisition = next;
        }
        Self::update_aggregated(chunk, requisitions)
    }

    fn update_aggregated(chunk: &mut Chunk, requisitions: &mut RequisitionRegistry) -> AppResult<()> {
        chunk.requisition = requisitions
            .update_on_merge(chunk.id, chunk.requisition, chunk.live_entries(), chunk.vital)
            .map_err(AppError::Ise)?;
        Ok(())
    }
}

const METRIC_CHUNK_COUNT: &str = "chunk_master_chunk_count";
