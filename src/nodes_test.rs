use anyhow::Result;

use crate::error::AppError;
use crate::models::{ChunkId, ChunkReplica, NodeHealth, NodeId, StoredReplica};
use crate::nodes::NodeTracker;

fn replica(chunk: ChunkId, part_index: Option<u8>) -> StoredReplica {
    StoredReplica { chunk, part_index }
}

#[test]
fn registering_a_known_address_returns_its_id() {
    let mut nodes = NodeTracker::default();
    let first = nodes.register("10.0.0.1:9020");
    let second = nodes.register("10.0.0.2:9020");
    assert_eq!((first, second), (NodeId(0), NodeId(1)), "expected IDs assigned in registration order");
    assert_eq!(nodes.register("10.0.0.1:9020"), first, "expected re-registration to be idempotent");
    assert_eq!(nodes.len(), 2);
    assert!(matches!(nodes.get(NodeId(7)), Err(AppError::NodeNotFound(NodeId(7)))));
}

#[test]
fn node_ids_are_not_reused_after_removal() {
    let mut nodes = NodeTracker::default();
    let first = nodes.register("10.0.0.1:9020");
    assert!(nodes.remove(first).is_some());
    assert!(nodes.remove(first).is_none(), "expected second removal to find nothing");
    let next = nodes.register("10.0.0.1:9020");
    assert_ne!(next, first, "expected a fresh ID for a node registered after removal");
}

#[test]
fn inventory_diff_covers_live_and_destroyed_replicas() -> Result<()> {
    let mut nodes = NodeTracker::default();
    let id = nodes.register("10.0.0.1:9020");
    let (live, destroyed, new) = (ChunkId::generate(), ChunkId::generate(), ChunkId::generate());
    {
        let node = nodes.get_mut(id)?;
        node.replicas.insert(replica(live, None));
        node.destroyed_replicas.insert(replica(destroyed, None));
    }

    let diff = nodes.diff_inventory(id, &[replica(destroyed, None), replica(new, Some(2))])?;
    assert_eq!(diff.added, vec![replica(new, Some(2))], "expected only the unknown replica to be added");
    assert_eq!(diff.lost, vec![replica(live, None)], "expected the unreported replica to be lost");

    let diff = nodes.diff_inventory(id, &[replica(live, None), replica(destroyed, None)])?;
    assert!(diff.added.is_empty() && diff.lost.is_empty(), "expected a matching inventory to yield no diff");
    Ok(())
}

#[test]
fn destroying_chunk_replicas_moves_every_part() -> Result<()> {
    let mut nodes = NodeTracker::default();
    let (a, b) = (nodes.register("10.0.0.1:9020"), nodes.register("10.0.0.2:9020"));
    let (chunk, other) = (ChunkId::generate(), ChunkId::generate());
    nodes.get_mut(a)?.replicas.insert(replica(chunk, Some(0)));
    nodes.get_mut(a)?.replicas.insert(replica(chunk, Some(3)));
    nodes.get_mut(b)?.replicas.insert(replica(chunk, Some(1)));
    nodes.get_mut(b)?.replicas.insert(replica(other, None));

    nodes.destroy_chunk_replicas(chunk);
    let mut destroyed = nodes.destroyed_replicas_of(chunk);
    destroyed.sort();
    let mut expected = vec![ChunkReplica::new(a, Some(0)), ChunkReplica::new(a, Some(3)), ChunkReplica::new(b, Some(1))];
    expected.sort();
    assert_eq!(destroyed, expected);
    assert!(!nodes.get(a)?.holds_chunk(chunk), "expected no live part of the chunk to remain");
    assert!(nodes.get(b)?.holds_chunk(other), "expected other chunks to be untouched");
    assert_eq!(nodes.chunks_with_destroyed_replicas().into_iter().collect::<Vec<_>>(), vec![chunk]);
    Ok(())
}

#[test]
fn health_flags_govern_node_usability() -> Result<()> {
    let mut nodes = NodeTracker::default();
    let id = nodes.register("10.0.0.1:9020");
    nodes.get_mut(id)?.online = true;
    assert!(nodes.get(id)?.is_writable());
    assert_eq!(nodes.online_node_count(), 1);

    let write_disabled = NodeHealth {
        write_sessions_disabled: true,
        ..Default::default()
    };
    nodes.set_health(id, write_disabled)?;
    let node = nodes.get(id)?;
    assert!(!node.is_writable() && node.is_safe() && node.is_readable(), "expected write-disabled replicas to stay safe");

    nodes.set_health(id, NodeHealth { decommissioned: true, ..Default::default() })?;
    let node = nodes.get(id)?;
    assert!(!node.is_safe() && node.is_readable(), "expected decommissioned node to serve as a source only");

    nodes.set_health(id, NodeHealth { banned: true, ..Default::default() })?;
    assert!(!nodes.get(id)?.is_readable());
    assert_eq!(nodes.online_node_count(), 0, "expected banned nodes not to count as online");
    Ok(())
}
