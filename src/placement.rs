//! Replica placement.
//!
//! Chunks are placed either by weighted-random selection over writable nodes, or, for chunks
//! which opted into consistent placement at creation, by walking the token ring from the
//! chunk's placement hash. Consistent placement is a pure function of the placement hash, the
//! requested count and the ring & node state, so chunks sharing a placement hash collocate.

use std::collections::BTreeSet;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::config::DynamicConfig;
use crate::models::{ChunkId, NodeId};
use crate::nodes::{Node, NodeTracker};
use crate::ring::RingGeneration;

/// Compute the consistent placement hash of a placement group.
///
/// Chunks written on behalf of the same group share their hash, and thus their replica nodes.
pub fn consistent_placement_hash(group: &str) -> u64 {
    seahash::hash(group.as_bytes())
}

/// A request for replica targets of a chunk.
#[derive(Clone, Debug)]
pub struct PlacementRequest<'a> {
    pub chunk: ChunkId,
    /// The space needed on a target node.
    pub size: u64,
    /// The consistent placement hash of the chunk, if it opted into consistent placement.
    pub consistent_hash: Option<u64>,
    /// Nodes which must not be selected.
    pub excluded: &'a BTreeSet<NodeId>,
}

/// The placement engine, operating over a fixed view of the cluster.
pub struct PlacementEngine<'a> {
    nodes: &'a NodeTracker,
    ring: &'a RingGeneration,
    config: &'a DynamicConfig,
}

impl<'a> PlacementEngine<'a> {
    pub fn new(nodes: &'a NodeTracker, ring: &'a RingGeneration, config: &'a DynamicConfig) -> Self {
        Self { nodes, ring, config }
    }

    /// Check if consistent placement governs the given request.
    pub fn is_consistent(&self, request: &PlacementRequest) -> bool {
        request.consistent_hash.is_some() && self.config.consistent_replica_placement.enable && !self.ring.is_empty()
    }

    /// The number of replicas governed by consistent placement for the given desired count.
    pub fn consistent_count(&self, desired_count: usize) -> usize {
        desired_count.min(self.config.consistent_replica_placement.replicas_per_chunk)
    }

    /// Compute an ordered set of target nodes for the given request.
    ///
    /// In consistent mode, the first `replicas_per_chunk` targets come from the ring and
    /// any remainder is filled through legacy placement.
    pub fn place<R: Rng>(&self, request: &PlacementRequest, desired_count: usize, rng: &mut R) -> Vec<NodeId> {
        if !self.is_consistent(request) {
            return self.allocate(request, desired_count, rng);
        }
        let hash = request.consistent_hash.unwrap_or_default();
        let mut targets = self.consistent_targets(request.chunk, hash, self.consistent_count(desired_count));
        if targets.len() < desired_count {
            let mut excluded = request.excluded.clone();
            excluded.extend(targets.iter().copied());
            let fill = PlacementRequest { excluded: &excluded, ..request.clone() };
            targets.extend(self.allocate(&fill, desired_count - targets.len(), rng));
        }
        targets
    }

    /// Walk the ring from the given hash, collecting the first `count` distinct healthy nodes.
    ///
    /// Nodes not accepting new replicas are skipped, unless they already store the chunk.
    pub fn consistent_targets(&self, chunk: ChunkId, hash: u64, count: usize) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut targets = Vec::with_capacity(count);
        if count == 0 {
            return targets;
        }
        for token in self.ring.walk(hash) {
            if !seen.insert(token.node) {
                continue;
            }
            let eligible = match self.nodes.get(token.node) {
                Ok(node) => node.is_safe() && (node.health.accepts_new_replicas() || node.holds_chunk(chunk)),
                Err(_) => false,
            };
            if !eligible {
                continue;
            }
            targets.push(token.node);
            if targets.len() == count {
                break;
            }
        }
        targets
    }

    /// Select up to `count` distinct nodes by weighted-random selection on free space.
    pub fn allocate<R: Rng>(&self, request: &PlacementRequest, count: usize, rng: &mut R) -> Vec<NodeId> {
        let mut candidates: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|node| node.is_writable() && node.free_space() >= request.size && !request.excluded.contains(&node.id))
            .collect();
        let mut selected = Vec::with_capacity(count);
        while selected.len() < count && !candidates.is_empty() {
            let weights = candidates.iter().map(|node| node.free_space().max(1));
            let index = match WeightedIndex::new(weights) {
                Ok(dist) => dist.sample(rng),
                Err(err) => {
                    tracing::warn!(error = ?err, chunk = %request.chunk, "error building placement weights");
                    break;
                }
            };
            selected.push(candidates.swap_remove(index).id);
        }
        selected
    }
}
