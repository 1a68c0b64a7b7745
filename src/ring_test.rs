use std::collections::BTreeSet;

use anyhow::{Context, Result};

use crate::models::NodeId;
use crate::ring::{RingSnapshot, TokenRing};

const TOKENS_PER_NODE: u32 = 7;
const BUCKETS: u32 = 10;

fn build_ring(weights: &[u64]) -> TokenRing {
    let mut ring = TokenRing::default();
    for (id, weight) in weights.iter().enumerate() {
        ring.register_node(NodeId(id as u32), *weight, TOKENS_PER_NODE, BUCKETS);
    }
    ring
}

#[test]
fn token_positions_are_deterministic() {
    let weights = [100, 200, 300, 400, 500];
    let (left, right) = (build_ring(&weights), build_ring(&weights));
    let (left, right) = (left.current(), right.current());

    let left_tokens: Vec<_> = left.walk(0).copied().collect();
    let right_tokens: Vec<_> = right.walk(0).copied().collect();
    assert_eq!(left_tokens, right_tokens, "expected identically built rings to be identical");
    assert_eq!(left.generation(), right.generation(), "expected identical generations");
}

#[test]
fn rebalance_keeps_token_counts_within_band() -> Result<()> {
    let weights: Vec<u64> = (1..=20).map(|idx| idx * 1_000).collect();
    let mut ring = build_ring(&weights);
    ring.rebalance(TOKENS_PER_NODE, BUCKETS);

    let current = ring.current();
    let (min, max) = (TOKENS_PER_NODE as usize, (TOKENS_PER_NODE * BUCKETS) as usize);
    for (node, tokens) in current.nodes() {
        assert!(
            (min..=max).contains(&tokens.len()),
            "expected token count of {} to be within [{}, {}], got {}",
            node,
            min,
            max,
            tokens.len()
        );
    }
    let lightest = current.tokens(NodeId(0)).len();
    let heaviest = current.tokens(NodeId(19)).len();
    assert!(heaviest > lightest, "expected heavier nodes to receive more tokens, got {} <= {}", heaviest, lightest);
    current.validate()?;
    Ok(())
}

#[test]
fn rebalance_only_touches_the_tail_of_token_lists() {
    let mut ring = build_ring(&[100, 100, 100, 100]);
    ring.rebalance(TOKENS_PER_NODE, BUCKETS);
    let before = ring.current();

    // Node 0 becomes the heaviest node, all other nodes shift down one rank.
    ring.set_weight(NodeId(0), 10_000);
    let delta = ring.rebalance(TOKENS_PER_NODE, BUCKETS);
    let after = ring.current();

    assert!(!delta.is_empty(), "expected a weight change to change the ring");
    assert_eq!(delta.generation, after.generation(), "expected delta to carry the new generation");
    for (node, tokens) in before.nodes() {
        let kept = tokens.len().min(after.tokens(*node).len());
        assert_eq!(
            &tokens[..kept],
            &after.tokens(*node)[..kept],
            "expected untouched tokens of {} to keep their positions",
            node
        );
    }

    let noop = ring.rebalance(TOKENS_PER_NODE, BUCKETS);
    assert!(noop.is_empty(), "expected a second rebalance to be a no-op");
    assert_eq!(noop.generation, after.generation(), "expected a no-op rebalance to keep the generation");
}

#[test]
fn unregister_node_leaves_no_gap() {
    let mut ring = build_ring(&[100, 200, 300]);
    let removed = ring.unregister_node(NodeId(1));

    assert!(!removed.is_empty(), "expected tokens of the unregistered node to be returned");
    let current = ring.current();
    assert!(current.walk(0).all(|token| token.node != NodeId(1)), "expected no tokens of the unregistered node");
    let nodes: BTreeSet<_> = current.walk(0).map(|token| token.node).collect();
    assert_eq!(nodes, [NodeId(0), NodeId(2)].into_iter().collect(), "expected remaining nodes to stay on the ring");
    assert!(ring.unregister_node(NodeId(1)).is_empty(), "expected unregistering twice to be a no-op");
}

#[test]
fn walk_wraps_around_once() {
    let ring = build_ring(&[100, 200, 300]);
    let current = ring.current();
    let total = current.token_count();

    for position in [0, u64::MAX / 3, u64::MAX] {
        let walked: Vec<_> = current.walk(position).collect();
        assert_eq!(walked.len(), total, "expected walk from {} to visit every token exactly once", position);
        let wraps_immediately = current.walk(0).all(|token| token.position < position);
        if let Some(first) = walked.first() {
            assert!(
                first.position >= position || wraps_immediately,
                "expected walk from {} to begin at or after its start position",
                position
            );
        }
    }
}

#[test]
fn restore_rejects_tampered_rings() -> Result<()> {
    let ring = build_ring(&[100, 200, 300]);
    let snapshot = ring.snapshot();

    let encoded = serde_json::to_vec(&snapshot)?;
    let decoded: RingSnapshot = serde_json::from_slice(&encoded)?;
    let restored = TokenRing::restore(decoded)?;
    let expected: Vec<_> = ring.current().walk(42).copied().collect();
    let actual: Vec<_> = restored.current().walk(42).copied().collect();
    assert_eq!(expected, actual, "expected restored ring to walk identically");

    let mut value: serde_json::Value = serde_json::from_slice(&encoded)?;
    let position = value.pointer_mut("/ring/nodes/0/1/0/position").context("expected encoded token position")?;
    *position = serde_json::json!(7u64);
    let tampered: RingSnapshot = serde_json::from_value(value)?;
    assert!(TokenRing::restore(tampered).is_err(), "expected a tampered token position to be rejected");
    Ok(())
}
