//! Replicator jobs & the finished job history.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::models::{ChunkId, ChunkReplica, JobId, NodeId};

/// The kind-specific payload of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum JobKind {
    /// Copy a replica from `source` onto the target node.
    ///
    /// In pull mode the target retrieves the replica at its own pace.
    Replicate { source: NodeId, part_index: Option<u8>, pull: bool },
    /// Delete a replica from the target node.
    Remove { part_index: Option<u8> },
    /// Copy a misplaced replica from `source` onto its consistent target node.
    ///
    /// The off-target copy is dropped as surplus once the target reports the replica.
    Balance { source: NodeId, part_index: Option<u8> },
    /// Reconstruct missing erasure parts on the target node from surviving parts.
    Repair { sources: Vec<ChunkReplica>, parts: Vec<u8> },
}

/// A unit of work scheduled by the replicator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub chunk: ChunkId,
    /// The node on which the job's result materializes.
    pub target: NodeId,
    pub kind: JobKind,
}

impl Job {
    pub fn new(chunk: ChunkId, target: NodeId, kind: JobKind) -> Self {
        Self {
            id: JobId::generate(),
            chunk,
            target,
            kind,
        }
    }

    /// The node which executes this job.
    ///
    /// Push replication & balancing are executed by the source node, everything else by the
    /// target node.
    pub fn executor(&self) -> NodeId {
        match &self.kind {
            JobKind::Replicate { source, pull: false, .. } | JobKind::Balance { source, .. } => *source,
            JobKind::Replicate { pull: true, .. } | JobKind::Remove { .. } | JobKind::Repair { .. } => self.target,
        }
    }

    /// The kind of this job as a static label.
    pub fn kind_label(&self) -> &'static str {
        match &self.kind {
            JobKind::Replicate { .. } => "replicate",
            JobKind::Remove { .. } => "remove",
            JobKind::Balance { .. } => "balance",
            JobKind::Repair { .. } => "repair",
        }
    }

    /// Dispatch this job to its executor node.
    pub fn apply(&self, client: &dyn NodeClient) -> Result<()> {
        client.dispatch_job(self.executor(), self.clone())
    }
}

/// A client used for dispatching jobs to storage nodes.
///
/// Dispatch is fire-and-forget: completion is reported asynchronously through the master.
pub trait NodeClient: Send + Sync {
    fn dispatch_job(&self, node: NodeId, job: Job) -> Result<()>;

    /// Drop all jobs which have not yet been handed to their nodes.
    fn cancel_undelivered(&self) {}
}

/// The terminal state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Completed,
    /// The job did not finish in time, or was cancelled.
    Aborted,
    Failed,
}

/// A job which is currently running.
#[derive(Clone, Debug)]
pub struct RunningJob {
    pub job: Job,
    pub deadline: Instant,
}

/// A job which has reached a terminal state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FinishedJob {
    pub job: Job,
    pub state: JobState,
}

/// A bounded FIFO of the most recently finished jobs, indexed by chunk.
///
/// The bound is global: once it is exceeded, the oldest job is evicted regardless of the chunk
/// it belongs to.
#[derive(Debug, Default)]
pub struct JobHistory {
    order: VecDeque<JobId>,
    jobs: HashMap<JobId, FinishedJob>,
    by_chunk: HashMap<ChunkId, VecDeque<JobId>>,
}

impl JobHistory {
    /// Record a finished job, evicting the oldest jobs beyond the given capacity.
    pub fn record(&mut self, finished: FinishedJob, capacity: usize) {
        let (id, chunk) = (finished.job.id, finished.job.chunk);
        self.order.push_back(id);
        self.jobs.insert(id, finished);
        self.by_chunk.entry(chunk).or_default().push_back(id);
        self.truncate(capacity);
    }

    /// Evict the oldest jobs until at most `capacity` remain.
    pub fn truncate(&mut self, capacity: usize) {
        while self.order.len() > capacity {
            let id = match self.order.pop_front() {
                Some(id) => id,
                None => break,
            };
            let finished = match self.jobs.remove(&id) {
                Some(finished) => finished,
                None => continue,
            };
            if let Some(ids) = self.by_chunk.get_mut(&finished.job.chunk) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.by_chunk.remove(&finished.job.chunk);
                }
            }
        }
    }

    /// The retained finished jobs of the given chunk, oldest first.
    pub fn jobs_of(&self, chunk: ChunkId) -> Vec<&FinishedJob> {
        self.by_chunk
            .get(&chunk)
            .map(|ids| ids.iter().filter_map(|id| self.jobs.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.jobs.clear();
        self.by_chunk.clear();
    }
}
