//! Token ring used for consistent replica placement.
//!
//! Every registered node owns a number of virtual tokens positioned in a 64-bit hash space.
//! A token's position is a pure function of the node ID, the token's index within the node's
//! token list, and the ring generation at which the token was minted. As such, any master
//! holding the same persisted ring state computes exactly the same ring.
//!
//! The ring is immutable per generation. All changes produce a new generation, and readers
//! holding an older `Arc<RingGeneration>` are never affected by a concurrent change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::models::NodeId;

/// The salt mixed into every token position.
const RING_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// A virtual token of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token {
    /// The node owning this token.
    pub node: NodeId,
    /// The index of this token within the node's token list.
    pub index: u32,
    /// The ring generation at which this token was minted.
    pub minted: u64,
    /// The position of this token in the hash space.
    pub position: u64,
}

impl Token {
    fn mint(node: NodeId, index: u32, minted: u64) -> Self {
        Self {
            node,
            index,
            minted,
            position: token_position(node, index, minted),
        }
    }
}

/// Compute the position of a token in the hash space.
pub fn token_position(node: NodeId, index: u32, minted: u64) -> u64 {
    let mut buf = [0u8; 24];
    buf[..8].copy_from_slice(&RING_SALT.to_be_bytes());
    buf[8..12].copy_from_slice(&node.0.to_be_bytes());
    buf[12..16].copy_from_slice(&index.to_be_bytes());
    buf[16..].copy_from_slice(&minted.to_be_bytes());
    seahash::hash(&buf)
}

/// The key under which a token is stored in the ring.
type RingKey = (u64, NodeId, u32);

/// A single immutable generation of the token ring.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RingGeneration {
    generation: u64,
    /// The tokens of each node, in token index order.
    #[serde(with = "crate::utils::pairs")]
    nodes: BTreeMap<NodeId, Vec<Token>>,
    /// All tokens, ordered by position.
    #[serde(skip)]
    ring: BTreeMap<RingKey, Token>,
}

impl RingGeneration {
    /// The generation number of this ring.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check if the ring holds no tokens at all.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// The number of nodes registered with the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The total number of tokens in the ring.
    pub fn token_count(&self) -> usize {
        self.ring.len()
    }

    /// The tokens of the given node, in token index order.
    pub fn tokens(&self, node: NodeId) -> &[Token] {
        self.nodes.get(&node).map(|tokens| tokens.as_slice()).unwrap_or(&[])
    }

    /// Iterate over all nodes along with their tokens.
    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &Vec<Token>)> {
        self.nodes.iter()
    }

    /// Walk the ring clockwise starting at the given position, wrapping around once.
    pub fn walk(&self, position: u64) -> impl Iterator<Item = &Token> + '_ {
        let start = (position, NodeId(0), 0);
        self.ring.range(start..).chain(self.ring.range(..start)).map(|(_, token)| token)
    }

    fn rebuild(&mut self) {
        self.ring = self
            .nodes
            .values()
            .flatten()
            .map(|token| ((token.position, token.node, token.index), *token))
            .collect();
    }

    /// Validate the internal consistency of this ring generation.
    ///
    /// Positions are recomputed from their inputs, so a ring which fails validation can not
    /// be used to reproduce placement decisions.
    pub fn validate(&self) -> Result<()> {
        for (node, tokens) in self.nodes.iter() {
            for (offset, token) in tokens.iter().enumerate() {
                if token.node != *node {
                    bail!("token {} of {} is recorded under {}", token.index, token.node, node);
                }
                if token.index as usize != offset {
                    bail!("token list of {} has a gap at index {}", node, offset);
                }
                if token.minted > self.generation {
                    bail!("token {} of {} was minted in future generation {}", token.index, node, token.minted);
                }
                if token.position != token_position(token.node, token.index, token.minted) {
                    bail!("token {} of {} has a position which does not match its inputs", token.index, node);
                }
            }
        }
        let expected: usize = self.nodes.values().map(|tokens| tokens.len()).sum();
        if expected != self.ring.len() {
            bail!("ring holds {} tokens, expected {}", self.ring.len(), expected);
        }
        Ok(())
    }
}

/// The change produced by a ring rebalance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingDelta {
    /// The generation produced by the rebalance.
    pub generation: u64,
    /// Tokens added per node.
    pub added: BTreeMap<NodeId, Vec<Token>>,
    /// Tokens removed per node.
    pub removed: BTreeMap<NodeId, Vec<Token>>,
}

impl RingDelta {
    /// Check if the rebalance changed nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// All nodes whose tokens changed.
    pub fn affected_nodes(&self) -> BTreeSet<NodeId> {
        self.added.keys().chain(self.removed.keys()).copied().collect()
    }
}

/// The persisted state of the ring.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RingSnapshot {
    pub ring: RingGeneration,
    #[serde(with = "crate::utils::pairs")]
    pub weights: BTreeMap<NodeId, u64>,
}

/// The token ring, holding the current generation and the weights of all nodes.
#[derive(Clone, Debug, Default)]
pub struct TokenRing {
    current: Arc<RingGeneration>,
    /// Node weights used for ranking nodes into token buckets.
    weights: BTreeMap<NodeId, u64>,
}

impl TokenRing {
    /// Restore a ring from its persisted state, validating it.
    pub fn restore(snapshot: RingSnapshot) -> Result<Self> {
        let RingSnapshot { mut ring, weights } = snapshot;
        ring.rebuild();
        ring.validate()?;
        if let Some(node) = ring.nodes.keys().find(|node| !weights.contains_key(node)) {
            bail!("ring holds tokens of {} which has no weight", node);
        }
        Ok(Self { current: Arc::new(ring), weights })
    }

    /// Build the persisted state of this ring.
    pub fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            ring: self.current.as_ref().clone(),
            weights: self.weights.clone(),
        }
    }

    /// The current ring generation.
    pub fn current(&self) -> Arc<RingGeneration> {
        self.current.clone()
    }

    /// Check if the given node is registered with the ring.
    pub fn contains(&self, node: NodeId) -> bool {
        self.weights.contains_key(&node)
    }

    /// Update the weight of a node, taking effect at the next rebalance.
    pub fn set_weight(&mut self, node: NodeId, weight: u64) {
        if let Some(current) = self.weights.get_mut(&node) {
            *current = weight;
        }
    }

    /// Register a node with the ring, minting its initial tokens.
    ///
    /// Registering an already registered node is a no-op returning its current tokens.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn register_node(&mut self, node: NodeId, weight: u64, tokens_per_node: u32, bucket_count: u32) -> Vec<Token> {
        if self.weights.contains_key(&node) {
            return self.current.tokens(node).to_vec();
        }
        self.weights.insert(node, weight);
        let desired = self.desired_token_counts(tokens_per_node, bucket_count);
        let count = desired.get(&node).copied().unwrap_or(tokens_per_node);

        let mut next = self.current.as_ref().clone();
        next.generation += 1;
        let tokens: Vec<_> = (0..count).map(|index| Token::mint(node, index, next.generation)).collect();
        next.nodes.insert(node, tokens.clone());
        next.rebuild();
        self.current = Arc::new(next);
        tracing::debug!(%node, tokens = count, generation = self.current.generation, "node registered with token ring");
        tokens
    }

    /// Unregister a node, removing all of its tokens.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn unregister_node(&mut self, node: NodeId) -> Vec<Token> {
        if self.weights.remove(&node).is_none() {
            return vec![];
        }
        let mut next = self.current.as_ref().clone();
        next.generation += 1;
        let tokens = next.nodes.remove(&node).unwrap_or_default();
        next.rebuild();
        self.current = Arc::new(next);
        tokens
    }

    /// Rebalance the token counts of all nodes according to their weights.
    ///
    /// Nodes are ranked by weight and spread over `bucket_count` buckets. A node in bucket `b`
    /// targets `tokens_per_node * (b + 1)` tokens. Tokens are only ever added to or removed
    /// from the tail of a node's token list, so all other tokens keep their position.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rebalance(&mut self, tokens_per_node: u32, bucket_count: u32) -> RingDelta {
        let desired = self.desired_token_counts(tokens_per_node, bucket_count);
        let mut next = self.current.as_ref().clone();
        let generation = next.generation + 1;
        let mut delta = RingDelta::default();

        for (node, count) in desired {
            let tokens = next.nodes.entry(node).or_default();
            let current = tokens.len() as u32;
            if count > current {
                let added: Vec<_> = (current..count).map(|index| Token::mint(node, index, generation)).collect();
                tokens.extend(added.iter().copied());
                delta.added.insert(node, added);
            } else if count < current {
                let removed = tokens.split_off(count as usize);
                delta.removed.insert(node, removed);
            }
        }

        if delta.is_empty() {
            delta.generation = next.generation;
            return delta;
        }
        next.generation = generation;
        next.rebuild();
        self.current = Arc::new(next);
        delta.generation = generation;
        tracing::debug!(
            generation,
            nodes_changed = delta.affected_nodes().len(),
            "token ring rebalanced"
        );
        delta
    }

    /// Compute the desired token count of every registered node.
    fn desired_token_counts(&self, tokens_per_node: u32, bucket_count: u32) -> BTreeMap<NodeId, u32> {
        let tokens_per_node = tokens_per_node.max(1);
        let bucket_count = bucket_count.max(1) as u64;
        let mut ranked: Vec<_> = self.weights.iter().map(|(node, weight)| (*weight, *node)).collect();
        ranked.sort_unstable();
        let node_count = ranked.len() as u64;
        ranked
            .into_iter()
            .enumerate()
            .map(|(rank, (_, node))| {
                let bucket = (rank as u64 * bucket_count / node_count) as u32;
                (node, tokens_per_node.saturating_mul(bucket + 1))
            })
            .collect()
    }
}
