//! The chunk replicator.
//!
//! The replicator continuously reconciles the stored replicas of every chunk against the
//! replicas it ought to have, emitting at most one job per chunk at a time. It runs only on
//! the leader, and all of its state is local to the leader: it is rebuilt through a full
//! reconciliation whenever this master becomes the leader.

mod jobs;
#[cfg(test)]
mod jobs_test;
mod queue;
#[cfg(test)]
mod queue_test;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::chunks::Chunk;
use crate::config::DynamicConfig;
use crate::master::ChunkMaster;
use crate::models::{ChunkId, ChunkReplica, JobId, NodeId};
use crate::nodes::{Node, NodeTracker};
use crate::placement::{PlacementEngine, PlacementRequest};
use crate::ring::RingGeneration;

pub use jobs::{FinishedJob, Job, JobHistory, JobKind, JobState, NodeClient, RunningJob};
pub use queue::RefreshQueue;

const METRIC_JOBS_SCHEDULED: &str = "chunk_master_replicator_jobs_scheduled";
const METRIC_JOBS_FINISHED: &str = "chunk_master_replicator_jobs_finished";
const METRIC_REPLICATOR_ENABLED: &str = "chunk_master_chunk_replicator_enabled";
const METRIC_LOST_CHUNKS: &str = "chunk_master_lost_chunks";
const METRIC_LOST_VITAL_CHUNKS: &str = "chunk_master_lost_vital_chunks";
const METRIC_VITAL_ALERTS: &str = "chunk_master_vital_chunk_loss_alerts";

/// The replication status of all chunks, as observed by the last refresh of each chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationStatus {
    pub lost_chunks: BTreeSet<ChunkId>,
    pub lost_vital_chunks: BTreeSet<ChunkId>,
    pub underreplicated_chunks: BTreeSet<ChunkId>,
    pub overreplicated_chunks: BTreeSet<ChunkId>,
    pub data_missing_chunks: BTreeSet<ChunkId>,
    pub parity_missing_chunks: BTreeSet<ChunkId>,
    pub inconsistently_placed_chunks: BTreeSet<ChunkId>,
    /// Erasure chunks with several parts on one node.
    pub unsafely_placed_chunks: BTreeSet<ChunkId>,
}

impl ReplicationStatus {
    fn clear_chunk(&mut self, chunk: ChunkId) {
        for set in self.sets_mut() {
            set.remove(&chunk);
        }
    }

    fn sets_mut(&mut self) -> [&mut BTreeSet<ChunkId>; 8] {
        [
            &mut self.lost_chunks,
            &mut self.lost_vital_chunks,
            &mut self.underreplicated_chunks,
            &mut self.overreplicated_chunks,
            &mut self.data_missing_chunks,
            &mut self.parity_missing_chunks,
            &mut self.inconsistently_placed_chunks,
            &mut self.unsafely_placed_chunks,
        ]
    }
}

fn set_flag(set: &mut BTreeSet<ChunkId>, chunk: ChunkId, flag: bool) -> bool {
    if flag {
        set.insert(chunk)
    } else {
        set.remove(&chunk);
        false
    }
}

/// The chunk replicator.
pub struct Replicator {
    queue: RefreshQueue,
    running: HashMap<JobId, RunningJob>,
    /// The running job of each chunk.
    by_chunk: HashMap<ChunkId, JobId>,
    /// Consecutive job failures per chunk.
    failures: HashMap<ChunkId, u32>,
    /// Chunks which exhausted their retries, awaiting another event.
    parked: HashSet<ChunkId>,
    history: JobHistory,
    /// Replicate jobs handed to target nodes in pull mode.
    pull_queues: BTreeMap<NodeId, BTreeMap<ChunkId, JobId>>,
    status: ReplicationStatus,
    enabled: bool,
    rng: StdRng,
}

impl Default for Replicator {
    fn default() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl Replicator {
    pub fn new(rng: StdRng) -> Self {
        Self {
            queue: Default::default(),
            running: Default::default(),
            by_chunk: Default::default(),
            failures: Default::default(),
            parked: Default::default(),
            history: Default::default(),
            pull_queues: Default::default(),
            status: Default::default(),
            enabled: false,
            rng,
        }
    }

    pub fn status(&self) -> &ReplicationStatus {
        &self.status
    }

    pub fn history(&self) -> &JobHistory {
        &self.history
    }

    /// Whether the replicator was enabled as of the last round.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn running_jobs(&self) -> impl Iterator<Item = &RunningJob> {
        self.running.values()
    }

    /// The running job of the given chunk, if any.
    pub fn running_job_of(&self, chunk: ChunkId) -> Option<&Job> {
        self.by_chunk.get(&chunk).and_then(|id| self.running.get(id)).map(|running| &running.job)
    }

    pub fn queue(&self) -> &RefreshQueue {
        &self.queue
    }

    /// The pull replication queue of the given node.
    pub fn pull_queue(&self, node: NodeId) -> Vec<ChunkId> {
        self.pull_queues.get(&node).map(|queue| queue.keys().copied().collect()).unwrap_or_default()
    }

    /// The total number of pending pull replication entries across all nodes.
    pub fn pull_queue_len(&self) -> usize {
        self.pull_queues.values().map(|queue| queue.len()).sum()
    }

    pub fn is_parked(&self, chunk: ChunkId) -> bool {
        self.parked.contains(&chunk)
    }

    /// Enqueue a chunk for refresh following an event which touched it.
    pub fn enqueue(&mut self, chunk: ChunkId) {
        if self.parked.remove(&chunk) {
            self.failures.remove(&chunk);
        }
        self.queue.enqueue(chunk);
    }

    /// Enqueue every chunk known to the master, including chunks with destroyed replicas.
    pub fn enqueue_all(&mut self, master: &ChunkMaster) {
        self.parked.clear();
        self.failures.clear();
        for chunk in master.chunks().ids() {
            self.queue.enqueue(chunk);
        }
        for chunk in master.nodes().chunks_with_destroyed_replicas() {
            self.queue.enqueue(chunk);
        }
    }

    /// Drop all leader-local state, as this master is no longer the leader.
    pub fn drain(&mut self) {
        let running = self.running.len();
        self.queue.clear();
        self.running.clear();
        self.by_chunk.clear();
        self.failures.clear();
        self.parked.clear();
        self.pull_queues.clear();
        self.status = Default::default();
        self.enabled = false;
        metrics::gauge!(METRIC_REPLICATOR_ENABLED, 0.0);
        tracing::debug!(running, "replicator drained");
    }

    /// Recompute whether the replicator is enabled.
    ///
    /// Re-enabling the replicator triggers a full reconciliation.
    pub fn update_enabled(&mut self, master: &ChunkMaster, config: &DynamicConfig) -> bool {
        let online = master.nodes().online_node_count();
        let enabled = config.enable_chunk_replicator && online >= config.safe_online_node_count;
        if enabled != self.enabled {
            tracing::info!(enabled, online, safe_online_node_count = config.safe_online_node_count, "chunk replicator state changed");
            let value = if enabled { 1.0 } else { 0.0 };
            metrics::gauge!(METRIC_REPLICATOR_ENABLED, value);
            self.enabled = enabled;
            if enabled {
                self.enqueue_all(master);
            }
        }
        enabled
    }

    /// Run a single replicator round, returning the jobs to dispatch.
    #[tracing::instrument(level = "trace", skip(self, master, config, now))]
    pub fn run_round(&mut self, master: &ChunkMaster, config: &DynamicConfig, now: Instant) -> Vec<Job> {
        self.expire_jobs(config, now);
        if !config.consistent_replica_placement.enable {
            self.status.inconsistently_placed_chunks.clear();
        }
        if !self.update_enabled(master, config) {
            return vec![];
        }

        self.queue.promote(now);
        let mut jobs = vec![];
        let mut budget = self.queue.len();
        while jobs.len() < config.max_jobs_per_round && budget > 0 {
            budget -= 1;
            let chunk = match self.queue.pop() {
                Some(chunk) => chunk,
                None => break,
            };
            let job = match self.refresh_chunk(chunk, master, config) {
                Some(job) => job,
                None => {
                    if self.is_stalled(chunk, master) {
                        self.queue.enqueue_at(chunk, now + config.replicator_round_interval());
                    }
                    continue;
                }
            };
            tracing::debug!(job = %job.id, %chunk, kind = job.kind_label(), target = %job.target, "scheduling job");
            self.queue.cancel_delayed(chunk);
            metrics::increment_counter!(METRIC_JOBS_SCHEDULED, "kind" => job.kind_label());
            if let JobKind::Replicate { pull: true, .. } = job.kind {
                self.pull_queues.entry(job.target).or_default().insert(chunk, job.id);
            }
            self.by_chunk.insert(chunk, job.id);
            self.running.insert(
                job.id,
                RunningJob {
                    job: job.clone(),
                    deadline: now + config.job_timeout(),
                },
            );
            jobs.push(job);
        }
        metrics::gauge!(METRIC_LOST_CHUNKS, self.status.lost_chunks.len() as f64);
        metrics::gauge!(METRIC_LOST_VITAL_CHUNKS, self.status.lost_vital_chunks.len() as f64);
        jobs
    }

    /// Record the terminal state of a job.
    ///
    /// Failed & aborted jobs re-enqueue their chunk with exponential backoff, until the chunk
    /// exhausts its retries and is parked.
    pub fn job_finished(&mut self, id: JobId, state: JobState, config: &DynamicConfig, now: Instant) -> Option<FinishedJob> {
        let running = self.running.remove(&id)?;
        let chunk = running.job.chunk;
        self.by_chunk.remove(&chunk);
        if let Some(queue) = self.pull_queues.get_mut(&running.job.target) {
            if queue.get(&chunk) == Some(&id) {
                queue.remove(&chunk);
            }
        }
        metrics::increment_counter!(METRIC_JOBS_FINISHED, "kind" => running.job.kind_label(), "state" => state_label(state));

        match state {
            JobState::Completed => {
                self.failures.remove(&chunk);
                self.queue.enqueue_at(chunk, now + config.replicator_round_interval());
            }
            JobState::Failed | JobState::Aborted => {
                let failures = self.failures.entry(chunk).or_insert(0);
                *failures += 1;
                if *failures > config.max_job_retries {
                    tracing::warn!(%chunk, failures = *failures, "chunk exhausted its job retries, parking");
                    self.parked.insert(chunk);
                } else {
                    let backoff = config.job_retry_backoff(*failures);
                    tracing::debug!(%chunk, ?state, ?backoff, "job did not complete, retrying chunk after backoff");
                    self.queue.enqueue_at(chunk, now + backoff);
                }
            }
        }

        let finished = FinishedJob { job: running.job, state };
        self.history.record(finished.clone(), config.finished_jobs_queue_size);
        Some(finished)
    }

    /// Clear the pull queue entry of a replica which has been reported by its target.
    pub fn replica_reported(&mut self, chunk: ChunkId, node: NodeId) {
        if let Some(queue) = self.pull_queues.get_mut(&node) {
            queue.remove(&chunk);
        }
    }

    /// Enqueue all consistently placed chunks whose targets moved with a ring change.
    pub fn ring_changed(&mut self, master: &ChunkMaster, previous: &RingGeneration, config: &DynamicConfig) {
        let current = master.ring().current();
        if current.generation() == previous.generation() || !config.consistent_replica_placement.enable {
            return;
        }
        let before = PlacementEngine::new(master.nodes(), previous, config);
        let after = PlacementEngine::new(master.nodes(), &current, config);
        let mut moved = 0;
        for chunk in master.chunks().iter().filter(|chunk| !chunk.removed) {
            let hash = match chunk.consistent_placement_hash {
                Some(hash) => hash,
                None => continue,
            };
            let desired = chunk.desired_replica_count(config.max_replication_factor(&chunk.medium));
            let count = after.consistent_count(desired);
            if before.consistent_targets(chunk.id, hash, count) != after.consistent_targets(chunk.id, hash, count) {
                self.enqueue(chunk.id);
                moved += 1;
            }
        }
        tracing::debug!(moved, generation = current.generation(), "token ring changed");
    }

    /// Apply a new finished job history size.
    pub fn resize_history(&mut self, capacity: usize) {
        self.history.truncate(capacity);
    }

    /// Abort all running jobs whose deadline has passed.
    fn expire_jobs(&mut self, config: &DynamicConfig, now: Instant) {
        let expired: Vec<_> = self
            .running
            .values()
            .filter(|running| running.deadline <= now)
            .map(|running| running.job.id)
            .collect();
        for id in expired {
            tracing::debug!(job = %id, "job timed out");
            self.job_finished(id, JobState::Aborted, config, now);
        }
    }

    fn purge_pull_entries(&mut self, chunk: ChunkId) {
        for queue in self.pull_queues.values_mut() {
            queue.remove(&chunk);
        }
        self.pull_queues.retain(|_, queue| !queue.is_empty());
    }

    /// Re-evaluate a chunk, returning a job to bring it closer to its desired state.
    fn refresh_chunk(&mut self, id: ChunkId, master: &ChunkMaster, config: &DynamicConfig) -> Option<Job> {
        let chunk = match master.chunks().get(id) {
            Ok(chunk) if !chunk.removed => chunk,
            _ => {
                self.status.clear_chunk(id);
                self.purge_pull_entries(id);
                if self.by_chunk.contains_key(&id) {
                    return None;
                }
                return self.reclaim_destroyed(id, master.nodes());
            }
        };

        let ring = master.ring().current();
        let engine = PlacementEngine::new(master.nodes(), &ring, config);
        let mut ctx = RefreshContext {
            chunk,
            nodes: master.nodes(),
            engine,
            config,
            running: &self.running,
            rng: &mut self.rng,
        };
        let (job, flags) = if chunk.codec.is_erasure() {
            ctx.evaluate_erasure()
        } else {
            ctx.evaluate_regular()
        };
        self.apply_flags(chunk, flags);
        if self.by_chunk.contains_key(&id) {
            return None;
        }
        job
    }

    /// Check if a chunk which yielded no job still diverges from its desired state.
    ///
    /// Such chunks are refreshed again on a later round, as the nodes needed to fix them may
    /// become available without any event touching the chunk. Lost chunks and destroyed
    /// replicas on offline nodes wait for their nodes to come back instead.
    fn is_stalled(&self, chunk: ChunkId, master: &ChunkMaster) -> bool {
        if self.by_chunk.contains_key(&chunk) || self.parked.contains(&chunk) {
            return false;
        }
        if !master.chunks().is_live(chunk) {
            return false;
        }
        let status = &self.status;
        !status.lost_chunks.contains(&chunk)
            && (status.underreplicated_chunks.contains(&chunk)
                || status.overreplicated_chunks.contains(&chunk)
                || status.inconsistently_placed_chunks.contains(&chunk)
                || status.unsafely_placed_chunks.contains(&chunk))
    }

    /// Schedule the removal of a destroyed replica of a removed or unknown chunk.
    fn reclaim_destroyed(&mut self, chunk: ChunkId, nodes: &NodeTracker) -> Option<Job> {
        nodes
            .destroyed_replicas_of(chunk)
            .into_iter()
            .find(|replica| nodes.get(replica.node).map(|node| node.online).unwrap_or(false))
            .map(|replica| Job::new(chunk, replica.node, JobKind::Remove { part_index: replica.part_index }))
    }

    fn apply_flags(&mut self, chunk: &Chunk, flags: StatusFlags) {
        let id = chunk.id;
        let status = &mut self.status;
        set_flag(&mut status.lost_chunks, id, flags.lost);
        let newly_vital_lost = set_flag(&mut status.lost_vital_chunks, id, flags.lost && chunk.is_vital_loss());
        if newly_vital_lost {
            tracing::error!(chunk = %id, "all replicas of vital chunk lost");
            metrics::increment_counter!(METRIC_VITAL_ALERTS);
        }
        set_flag(&mut status.underreplicated_chunks, id, flags.underreplicated);
        set_flag(&mut status.overreplicated_chunks, id, flags.overreplicated);
        set_flag(&mut status.data_missing_chunks, id, flags.data_missing);
        set_flag(&mut status.parity_missing_chunks, id, flags.parity_missing);
        set_flag(&mut status.inconsistently_placed_chunks, id, flags.inconsistently_placed);
        set_flag(&mut status.unsafely_placed_chunks, id, flags.unsafely_placed);
    }
}

fn state_label(state: JobState) -> &'static str {
    match state {
        JobState::Completed => "completed",
        JobState::Aborted => "aborted",
        JobState::Failed => "failed",
    }
}

#[derive(Debug, Default)]
struct StatusFlags {
    lost: bool,
    underreplicated: bool,
    overreplicated: bool,
    data_missing: bool,
    parity_missing: bool,
    inconsistently_placed: bool,
    unsafely_placed: bool,
}

/// The view used while evaluating a single chunk.
struct RefreshContext<'a> {
    chunk: &'a Chunk,
    nodes: &'a NodeTracker,
    engine: PlacementEngine<'a>,
    config: &'a DynamicConfig,
    running: &'a HashMap<JobId, RunningJob>,
    rng: &'a mut StdRng,
}

impl<'a> RefreshContext<'a> {
    fn node(&self, id: NodeId) -> Option<&'a Node> {
        self.nodes.get(id).ok()
    }

    fn is_safe(&self, replica: &ChunkReplica) -> bool {
        self.node(replica.node).map(Node::is_safe).unwrap_or(false)
    }

    fn is_readable(&self, replica: &ChunkReplica) -> bool {
        self.node(replica.node).map(Node::is_readable).unwrap_or(false)
    }

    /// Check if the replica is on an online node which must be vacated.
    fn is_unsafe_online(&self, replica: &ChunkReplica) -> bool {
        self.node(replica.node).map(|node| node.online && !node.is_safe()).unwrap_or(false)
    }

    /// Pick the least loaded readable source among the given replicas.
    fn pick_source(&self, candidates: impl Iterator<Item = &'a ChunkReplica>) -> Option<&'a ChunkReplica> {
        candidates.filter(|replica| self.is_readable(replica)).min_by_key(|replica| {
            let load = self.running.values().filter(|running| running.job.executor() == replica.node).count();
            let stored = self.node(replica.node).map(|node| node.replicas.len()).unwrap_or(0);
            (load, stored, replica.node)
        })
    }

    fn request<'b>(&self, excluded: &'b BTreeSet<NodeId>) -> PlacementRequest<'b> {
        PlacementRequest {
            chunk: self.chunk.id,
            size: self.chunk.statistics.compressed_data_size,
            consistent_hash: self.chunk.consistent_placement_hash,
            excluded,
        }
    }

    fn pull(&self) -> bool {
        self.config.consistent_replica_placement.enable_pull_replication
    }

    fn evaluate_regular(&mut self) -> (Option<Job>, StatusFlags) {
        let chunk = self.chunk;
        let mut flags = StatusFlags::default();
        let desired = chunk.desired_replica_count(self.config.max_replication_factor(&chunk.medium));
        let safe: Vec<&ChunkReplica> = chunk.stored_replicas.iter().filter(|replica| self.is_safe(replica)).collect();
        let safe_nodes: BTreeSet<NodeId> = safe.iter().map(|replica| replica.node).collect();
        let holders: BTreeSet<NodeId> = chunk.replica_nodes().collect();

        if desired > 0 && !chunk.stored_replicas.iter().any(|replica| self.is_readable(replica)) {
            flags.lost = true;
            flags.underreplicated = true;
            return (None, flags);
        }
        flags.underreplicated = safe.len() < desired;
        flags.overreplicated = safe.len() > desired;

        let request = self.request(&holders);
        let targets = match (self.engine.is_consistent(&request), chunk.consistent_placement_hash) {
            (true, Some(hash)) => Some(self.engine.consistent_targets(chunk.id, hash, self.engine.consistent_count(desired))),
            _ => None,
        };
        let missing_target = targets
            .as_ref()
            .and_then(|targets| targets.iter().copied().find(|node| !safe_nodes.contains(node)));
        flags.inconsistently_placed = missing_target.is_some();

        // Under-replicated: copy onto a consistent target, or any writable node.
        if safe.len() < desired {
            let target = match missing_target.filter(|node| !holders.contains(node)) {
                Some(target) => Some(target),
                None => self.engine.allocate(&request, 1, &mut *self.rng).into_iter().next(),
            };
            let (target, source) = match (target, self.pick_source(chunk.stored_replicas.iter())) {
                (Some(target), Some(source)) => (target, source),
                _ => return (None, flags),
            };
            let kind = JobKind::Replicate {
                source: source.node,
                part_index: None,
                pull: self.pull(),
            };
            return (Some(Job::new(chunk.id, target, kind)), flags);
        }

        // Replicas on banned or decommissioned nodes go first, once enough safe replicas exist.
        if let Some(replica) = chunk.stored_replicas.iter().find(|replica| self.is_unsafe_online(replica)) {
            let kind = JobKind::Remove { part_index: None };
            return (Some(Job::new(chunk.id, replica.node, kind)), flags);
        }

        // Over-replicated: drop replicas off target, preferring the fullest nodes.
        if safe.len() > desired {
            let victim = safe
                .iter()
                .filter(|replica| targets.as_ref().map(|targets| !targets.contains(&replica.node)).unwrap_or(true))
                .min_by_key(|replica| (self.node(replica.node).map(Node::free_space).unwrap_or(0), replica.node));
            if let Some(victim) = victim {
                let kind = JobKind::Remove { part_index: None };
                return (Some(Job::new(chunk.id, victim.node, kind)), flags);
            }
            return (None, flags);
        }

        // Misplaced: move an off-target replica onto the missing target.
        if let (Some(target), Some(targets)) = (missing_target, targets.as_ref()) {
            if holders.contains(&target) {
                return (None, flags);
            }
            let source = self.pick_source(safe.iter().copied().filter(|replica| !targets.contains(&replica.node)));
            if let Some(source) = source {
                let kind = JobKind::Balance {
                    source: source.node,
                    part_index: None,
                };
                return (Some(Job::new(chunk.id, target, kind)), flags);
            }
        }
        (None, flags)
    }

    fn evaluate_erasure(&mut self) -> (Option<Job>, StatusFlags) {
        let chunk = self.chunk;
        let codec = chunk.codec;
        let mut flags = StatusFlags::default();
        let total = codec.total_part_count();
        let desired_parts = if chunk.data_parts_only() { codec.data_part_count() } else { total };
        let part_of = |replica: &ChunkReplica| replica.part_index.unwrap_or(0);

        let readable_parts: BTreeSet<u8> = chunk
            .stored_replicas
            .iter()
            .filter(|replica| self.is_readable(replica))
            .map(part_of)
            .collect();
        let safe_parts: BTreeSet<u8> = chunk.stored_replicas.iter().filter(|replica| self.is_safe(replica)).map(part_of).collect();
        let missing: Vec<u8> = (0..total).filter(|part| !readable_parts.contains(part)).collect();
        flags.data_missing = missing.iter().any(|part| codec.is_data_part(*part));
        flags.parity_missing = missing.iter().any(|part| !codec.is_data_part(*part) && *part < desired_parts);
        let unrepairable = if chunk.data_parts_only() {
            flags.data_missing
        } else {
            missing.len() > codec.guaranteed_repairable_part_count() as usize
        };
        if unrepairable {
            flags.lost = true;
            flags.underreplicated = true;
            return (None, flags);
        }
        flags.underreplicated = (0..desired_parts).any(|part| !safe_parts.contains(&part));

        let multi_part = self.config.allow_multiple_erasure_parts_per_node;
        let excluded_for = |part: u8| -> BTreeSet<NodeId> {
            chunk
                .stored_replicas
                .iter()
                .filter(|replica| multi_part.then(|| part_of(replica) == part).unwrap_or(true))
                .map(|replica| replica.node)
                .collect()
        };
        let holders: BTreeSet<NodeId> = chunk.replica_nodes().collect();
        let request = self.request(&holders);
        let targets = match (self.engine.is_consistent(&request), chunk.consistent_placement_hash) {
            (true, Some(hash)) => Some(self.engine.consistent_targets(chunk.id, hash, self.engine.consistent_count(desired_parts as usize))),
            _ => None,
        };

        // Parts lacking a safe replica: copy them off vacated nodes, or rebuild them.
        for part in (0..desired_parts).filter(|part| !safe_parts.contains(part)) {
            let excluded = excluded_for(part);
            let target = match targets.as_ref().and_then(|targets| targets.get(part as usize).copied()) {
                Some(target) if !excluded.contains(&target) => Some(target),
                _ => {
                    let request = PlacementRequest { excluded: &excluded, ..self.request(&holders) };
                    self.engine.allocate(&request, 1, &mut *self.rng).into_iter().next()
                }
            };
            let target = match target {
                Some(target) => target,
                None => continue,
            };
            let copies = chunk.stored_replicas.iter().filter(|replica| part_of(replica) == part);
            if let Some(source) = self.pick_source(copies) {
                let kind = JobKind::Replicate {
                    source: source.node,
                    part_index: Some(part),
                    pull: self.pull(),
                };
                return (Some(Job::new(chunk.id, target, kind)), flags);
            }
            let mut sources: Vec<ChunkReplica> = vec![];
            for replica in chunk.stored_replicas.iter().filter(|replica| self.is_readable(replica)) {
                if !sources.iter().any(|source| source.part_index == replica.part_index) {
                    sources.push(*replica);
                }
            }
            let kind = JobKind::Repair { sources, parts: vec![part] };
            return (Some(Job::new(chunk.id, target, kind)), flags);
        }

        // Surplus: parts which are not required, and duplicate copies of a part.
        let mut seen = BTreeSet::new();
        let mut surplus = vec![];
        let mut ordered: Vec<&ChunkReplica> = chunk.stored_replicas.iter().collect();
        let on_target = |replica: &ChunkReplica| {
            let part = part_of(replica) as usize;
            targets.as_ref().and_then(|targets| targets.get(part)) == Some(&replica.node)
        };
        // A node holding other parts of the chunk is the last place to keep a copy.
        let crowded = |replica: &ChunkReplica| {
            !multi_part
                && chunk
                    .stored_replicas
                    .iter()
                    .any(|other| other.node == replica.node && part_of(other) != part_of(replica))
        };
        ordered.sort_by_key(|replica| (!self.is_safe(replica), crowded(replica), !on_target(replica), replica.node));
        for replica in ordered {
            let part = part_of(replica);
            if part >= desired_parts || !seen.insert(part) {
                surplus.push(replica);
            }
        }
        // Surplus parts on offline nodes are dropped along with their node.
        let removable = surplus
            .iter()
            .filter(|replica| self.node(replica.node).map(|node| node.online).unwrap_or(false))
            .min_by_key(|replica| (self.is_safe(replica), replica.node));
        flags.overreplicated = removable.is_some();
        if let Some(replica) = removable {
            let kind = JobKind::Remove { part_index: replica.part_index };
            return (Some(Job::new(chunk.id, replica.node, kind)), flags);
        }

        // Parts sharing a node with another part, when every part needs a node of its own.
        if !multi_part {
            let mut parts_by_node: BTreeMap<NodeId, BTreeSet<u8>> = BTreeMap::new();
            for replica in chunk.stored_replicas.iter().filter(|replica| self.is_safe(replica)) {
                parts_by_node.entry(replica.node).or_default().insert(part_of(replica));
            }
            for (node, parts) in parts_by_node.iter().filter(|(_, parts)| parts.len() > 1) {
                flags.unsafely_placed = true;
                for part in parts.iter().skip(1).copied() {
                    let excluded = excluded_for(part);
                    let target = match targets.as_ref().and_then(|targets| targets.get(part as usize).copied()) {
                        Some(target) if !excluded.contains(&target) => Some(target),
                        _ => {
                            let request = PlacementRequest { excluded: &excluded, ..self.request(&holders) };
                            self.engine.allocate(&request, 1, &mut *self.rng).into_iter().next()
                        }
                    };
                    if let Some(target) = target {
                        let kind = JobKind::Balance {
                            source: *node,
                            part_index: Some(part),
                        };
                        return (Some(Job::new(chunk.id, target, kind)), flags);
                    }
                }
            }
        }

        // Misplaced parts under consistent placement.
        if let Some(targets) = targets.as_ref() {
            for (part, target) in targets.iter().enumerate() {
                let part = part as u8;
                let placed = chunk.stored_replicas.iter().any(|replica| replica.node == *target && part_of(replica) == part);
                if placed {
                    continue;
                }
                flags.inconsistently_placed = true;
                if excluded_for(part).contains(target) {
                    continue;
                }
                let copies = chunk.stored_replicas.iter().filter(|replica| part_of(replica) == part);
                if let Some(source) = self.pick_source(copies) {
                    let kind = JobKind::Balance {
                        source: source.node,
                        part_index: Some(part),
                    };
                    return (Some(Job::new(chunk.id, *target, kind)), flags);
                }
            }
        }
        (None, flags)
    }
}
