use std::time::{Duration, Instant};

use super::RefreshQueue;
use crate::models::ChunkId;

#[test]
fn enqueue_deduplicates_ready_chunks() {
    let mut queue = RefreshQueue::default();
    let (a, b) = (ChunkId::generate(), ChunkId::generate());

    queue.enqueue(a);
    queue.enqueue(b);
    queue.enqueue(a);
    assert_eq!(queue.len(), 2, "expected duplicate enqueue to be ignored");
    assert_eq!(queue.pop(), Some(a), "expected chunks to pop in enqueue order");

    queue.enqueue(a);
    assert_eq!(queue.pop(), Some(b));
    assert_eq!(queue.pop(), Some(a), "expected a popped chunk to be enqueueable again");
    assert!(queue.is_empty());
}

#[test]
fn delayed_chunks_are_promoted_once_due() {
    let mut queue = RefreshQueue::default();
    let (a, b) = (ChunkId::generate(), ChunkId::generate());
    let now = Instant::now();

    queue.enqueue_at(a, now + Duration::from_secs(1));
    queue.enqueue_at(b, now + Duration::from_secs(5));
    queue.promote(now);
    assert!(queue.is_empty(), "expected nothing to be ready before its time");

    queue.promote(now + Duration::from_secs(2));
    assert_eq!(queue.pop(), Some(a), "expected due chunk to be ready");
    assert_eq!(queue.delayed_len(), 1);

    queue.cancel_delayed(b);
    queue.promote(now + Duration::from_secs(10));
    assert!(queue.is_empty(), "expected cancelled entry to never become ready");
}

#[test]
fn delayed_entries_keep_the_earliest_instant() {
    let mut queue = RefreshQueue::default();
    let chunk = ChunkId::generate();
    let now = Instant::now();

    queue.enqueue_at(chunk, now + Duration::from_secs(5));
    queue.enqueue_at(chunk, now + Duration::from_secs(1));
    queue.enqueue_at(chunk, now + Duration::from_secs(3));
    assert_eq!(queue.delayed_len(), 1, "expected a single delayed entry per chunk");

    queue.promote(now + Duration::from_secs(1));
    assert_eq!(queue.pop(), Some(chunk), "expected the earliest instant to be kept");
    assert_eq!(queue.delayed_len(), 0);
    queue.promote(now + Duration::from_secs(10));
    assert!(queue.is_empty(), "expected later instants to be dropped");
}
