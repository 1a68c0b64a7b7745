//! Per-node mailboxes of dispatched replicator jobs.

use std::sync::Arc;

use anyhow::{bail, Result};
use dashmap::DashMap;

use crate::models::NodeId;
use crate::replicator::{Job, NodeClient};

/// The max number of undelivered jobs held for a single node.
pub const MAX_MAILBOX_JOBS: usize = 10_000;

/// A `NodeClient` which holds dispatched jobs until their executor node collects them.
#[derive(Clone, Default)]
pub struct JobMailbox {
    inner: Arc<DashMap<NodeId, Vec<Job>>>,
}

impl JobMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all jobs pending for the given node.
    pub fn take(&self, node: NodeId) -> Vec<Job> {
        self.inner.remove(&node).map(|(_, jobs)| jobs).unwrap_or_default()
    }
}

impl NodeClient for JobMailbox {
    fn dispatch_job(&self, node: NodeId, job: Job) -> Result<()> {
        let mut jobs = self.inner.entry(node).or_default();
        if jobs.len() >= MAX_MAILBOX_JOBS {
            bail!("job mailbox of {} is full", node);
        }
        jobs.push(job);
        Ok(())
    }

    fn cancel_undelivered(&self) {
        self.inner.clear();
    }
}
