use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{error::Result, store::ChunkStore};

/// Running counters, updated lock-free from any thread.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub saves: AtomicUsize,
    pub coalesced_saves: AtomicUsize,
    pub records_written: AtomicUsize,
    pub dropped_oversized: AtomicUsize,
    pub failed_flushes: AtomicUsize,
    pub loads_from_memory: AtomicUsize,
    pub loads_from_disk: AtomicUsize,
}

/// Point-in-time view of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub saves: usize,
    /// Saves that replaced a payload still waiting to be flushed.
    pub coalesced_saves: usize,
    pub records_written: usize,
    pub dropped_oversized: usize,
    pub failed_flushes: usize,
    pub loads_from_memory: usize,
    pub loads_from_disk: usize,
    pub pending_queued: usize,
    pub pending_flushing: usize,
    pub outstanding_tasks: usize,
    pub tasks_completed: usize,
    /// Tasks that returned an error or panicked.
    pub tasks_failed: usize,
    pub open_regions: usize,
    pub region_hits: usize,
    pub region_misses: usize,
    pub pooled_streams_created: usize,
}

impl ChunkStore {
    pub fn stats(&self) -> Result<StatsSnapshot> {
        let inner = &self.inner;
        let counters = &inner.stats;
        let (pending_queued, pending_flushing) = {
            let pending = inner.pending.lock()?;
            (pending.queued_len(), pending.flushing_len())
        };
        let (region_hits, region_misses) = inner.regions.stats()?;

        Ok(StatsSnapshot {
            saves: counters.saves.load(Ordering::Relaxed),
            coalesced_saves: counters.coalesced_saves.load(Ordering::Relaxed),
            records_written: counters.records_written.load(Ordering::Relaxed),
            dropped_oversized: counters.dropped_oversized.load(Ordering::Relaxed),
            failed_flushes: counters.failed_flushes.load(Ordering::Relaxed),
            loads_from_memory: counters.loads_from_memory.load(Ordering::Relaxed),
            loads_from_disk: counters.loads_from_disk.load(Ordering::Relaxed),
            pending_queued,
            pending_flushing,
            outstanding_tasks: self.scheduler.outstanding()?,
            tasks_completed: self.scheduler.completed(),
            tasks_failed: self.scheduler.failed(),
            open_regions: inner.regions.len()?,
            region_hits,
            region_misses,
            pooled_streams_created: inner.pool.created(),
        })
    }

    /// Logs a snapshot of the store's counters.
    pub fn collect_metrics(&self) -> Result<StatsSnapshot> {
        let stats = self.stats()?;

        tracing::info!(
            saves = stats.saves,
            coalesced_saves = stats.coalesced_saves,
            records_written = stats.records_written,
            dropped_oversized = stats.dropped_oversized,
            failed_flushes = stats.failed_flushes,
            loads_from_memory = stats.loads_from_memory,
            loads_from_disk = stats.loads_from_disk,
            pending_queued = stats.pending_queued,
            pending_flushing = stats.pending_flushing,
            outstanding_tasks = stats.outstanding_tasks,
            tasks_completed = stats.tasks_completed,
            tasks_failed = stats.tasks_failed,
            open_regions = stats.open_regions,
            region_hits = stats.region_hits,
            region_misses = stats.region_misses,
            pooled_streams_created = stats.pooled_streams_created,
            "Chunk store metrics"
        );

        Ok(stats)
    }
}
