use crate::region::ChunkPos;

use std::collections::HashMap;
use std::sync::Arc;

/// Payloads saved but not yet on disk.
///
/// `queued` holds the newest unflushed payload per chunk. A payload moves to
/// `flushing` while a worker writes it, so reads keep seeing it until the
/// physical write is done. A newer save during that window lands in `queued`
/// again and shadows the one in flight.
#[derive(Default)]
pub struct PendingWrites {
    queued: HashMap<ChunkPos, Arc<[u8]>>,
    flushing: HashMap<ChunkPos, Arc<[u8]>>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any queued payload for `pos`. Returns true when `pos` was
    /// not queued before, i.e. when a new flush is needed.
    pub fn insert(&mut self, pos: ChunkPos, payload: Arc<[u8]>) -> bool {
        self.queued.insert(pos, payload).is_none()
    }

    /// Newest payload for `pos`, queued or in flight.
    pub fn get(&self, pos: ChunkPos) -> Option<Arc<[u8]>> {
        self.queued
            .get(&pos)
            .or_else(|| self.flushing.get(&pos))
            .cloned()
    }

    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.queued.contains_key(&pos) || self.flushing.contains_key(&pos)
    }

    /// Chunks waiting to be flushed, in no particular order.
    pub fn queued_keys(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        self.queued.keys().copied()
    }

    /// Moves the queued payload for `pos` in flight.
    pub fn begin_flush(&mut self, pos: ChunkPos) -> Option<Arc<[u8]>> {
        let payload = self.queued.remove(&pos)?;
        self.flushing.insert(pos, Arc::clone(&payload));
        Some(payload)
    }

    /// Forgets an in-flight payload, unless a later flush already replaced it.
    pub fn finish_flush(&mut self, pos: ChunkPos, payload: &Arc<[u8]>) {
        if self
            .flushing
            .get(&pos)
            .is_some_and(|current| Arc::ptr_eq(current, payload))
        {
            self.flushing.remove(&pos);
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn flushing_len(&self) -> usize {
        self.flushing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.flushing.is_empty()
    }
}
