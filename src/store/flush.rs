use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::{
    error::Result,
    lock::ChunkLockGuard,
    region::{ChunkPos, WriteOutcome},
    scheduler::Task,
    store::StoreInner,
};

/// Flushes one pending chunk, whichever the worker gets to first.
pub struct FlushTask {
    store: Arc<StoreInner>,
}

impl FlushTask {
    pub fn new(store: Arc<StoreInner>) -> Self {
        Self { store }
    }
}

impl Task for FlushTask {
    fn name(&self) -> &'static str {
        "flush"
    }

    fn run(&self) -> Result<()> {
        self.store.flush_one()?;
        Ok(())
    }
}

impl StoreInner {
    /// Writes one queued chunk to its region file.
    ///
    /// Returns `false` once nothing is queued. A failed physical write is
    /// logged and the payload dropped; only lock failures surface as errors.
    pub(crate) fn flush_one(&self) -> Result<bool> {
        let Some((guard, payload)) = self.claim()? else {
            return Ok(false);
        };
        let pos = guard.pos();

        match self.write_chunk(pos, &payload) {
            Ok(WriteOutcome::TooLarge { sectors }) => {
                self.stats.dropped_oversized.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(x = pos.x, z = pos.z, sectors, "Chunk too large to store");
            }
            Ok(outcome) => {
                self.stats.records_written.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(x = pos.x, z = pos.z, ?outcome, "Flushed chunk");
            }
            Err(e) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                tracing::error!(x = pos.x, z = pos.z, error = %e, "Failed to flush chunk");
            }
        }

        drop(guard);
        self.pending.lock()?.finish_flush(pos, &payload);
        Ok(true)
    }

    /// Pops a queued chunk while holding its lock, so writes of one chunk
    /// reach the disk in save order. Chunks another worker is writing are
    /// skipped; if every queued chunk is busy, waits for one to free up.
    fn claim(&self) -> Result<Option<(ChunkLockGuard<'_>, Arc<[u8]>)>> {
        loop {
            let busy = {
                let mut pending = self.pending.lock()?;
                let mut busy = None;
                let mut claimed = None;
                for pos in pending.queued_keys() {
                    match self.locks.try_lock(pos)? {
                        Some(guard) => {
                            claimed = Some(guard);
                            break;
                        }
                        None => busy = busy.or(Some(pos)),
                    }
                }

                if let Some(guard) = claimed {
                    match pending.begin_flush(guard.pos()) {
                        Some(payload) => return Ok(Some((guard, payload))),
                        None => continue,
                    }
                }
                busy
            };

            match busy {
                Some(pos) => self.locks.wait_unlocked(pos)?,
                None => return Ok(None),
            }
        }
    }

    fn write_chunk(&self, pos: ChunkPos, payload: &[u8]) -> Result<WriteOutcome> {
        let region = self.regions.get_or_open(pos)?;
        let mut writer = self.pool.writer(pos)?;
        writer.write_all(payload)?;
        writer.commit(|pos, record| region.write(pos, record))
    }
}
