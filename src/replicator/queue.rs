//! The chunk refresh queue.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Instant;

use crate::models::ChunkId;

/// A deduplicating queue of chunks awaiting re-evaluation, with support for delayed entries.
#[derive(Debug, Default)]
pub struct RefreshQueue {
    ready: VecDeque<ChunkId>,
    /// Chunks currently in the ready queue.
    scheduled: HashSet<ChunkId>,
    delayed: BTreeSet<(Instant, ChunkId)>,
    /// The due instant of each delayed chunk.
    due: HashMap<ChunkId, Instant>,
}

impl RefreshQueue {
    /// Enqueue a chunk for refresh, unless it is already enqueued.
    pub fn enqueue(&mut self, chunk: ChunkId) {
        if self.scheduled.insert(chunk) {
            self.ready.push_back(chunk);
        }
    }

    /// Enqueue a chunk for refresh once the given instant has passed.
    ///
    /// A chunk has at most one delayed entry. The earliest instant wins.
    pub fn enqueue_at(&mut self, chunk: ChunkId, at: Instant) {
        if let Some(due) = self.due.get(&chunk).copied() {
            if due <= at {
                return;
            }
            self.delayed.remove(&(due, chunk));
        }
        self.delayed.insert((at, chunk));
        self.due.insert(chunk, at);
    }

    /// Move all delayed chunks due at the given instant into the ready queue.
    pub fn promote(&mut self, now: Instant) {
        while let Some((at, chunk)) = self.delayed.iter().next().copied() {
            if at > now {
                break;
            }
            self.delayed.remove(&(at, chunk));
            self.due.remove(&chunk);
            self.enqueue(chunk);
        }
    }

    /// Pop the next chunk to refresh.
    pub fn pop(&mut self) -> Option<ChunkId> {
        let chunk = self.ready.pop_front()?;
        self.scheduled.remove(&chunk);
        Some(chunk)
    }

    /// Drop all pending delayed entries of the given chunk.
    pub fn cancel_delayed(&mut self, chunk: ChunkId) {
        if let Some(due) = self.due.remove(&chunk) {
            self.delayed.remove(&(due, chunk));
        }
    }

    /// The number of chunks ready for refresh.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// The number of delayed entries.
    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn clear(&mut self) {
        self.ready.clear();
        self.scheduled.clear();
        self.delayed.clear();
        self.due.clear();
    }
}
