//! The chunk persistence coordinator.
//!
//! ```text
//!   save ──► pending map ──► flush task ──► worker ──┐
//!                 ▲                                  │ chunk lock
//!   load ─────────┤                                  ▼
//!                 └──── region cache ◄──── pooled writer ──► region file
//! ```
//!
//! `save` only touches the pending map and the task queue. Workers pop one
//! arbitrary pending chunk per task, so a burst of saves spreads across
//! workers instead of draining in arrival order. Locks are always taken in
//! the order pending map, chunk lock, region file.

pub mod flush;
pub mod metrics;
pub mod pending;

pub use metrics::{StatsSnapshot, StoreStats};
pub use pending::PendingWrites;

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::flock::SessionLock;
use crate::lock::ChunkLocks;
use crate::pool::BufferPool;
use crate::region::{ChunkPos, RegionCache};
use crate::scheduler::Scheduler;

use flush::FlushTask;

/// State shared between the store handle and its flush workers.
pub struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) regions: RegionCache,
    pub(crate) locks: ChunkLocks,
    pub(crate) pending: Mutex<PendingWrites>,
    pub(crate) stats: StoreStats,
}

pub struct ChunkStore {
    inner: Arc<StoreInner>,
    scheduler: Scheduler,
    session: Mutex<Option<SessionLock>>,
    closed: AtomicBool,
}

impl ChunkStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let session = if config.session_lock {
            Some(SessionLock::acquire(&config.dir)?)
        } else {
            None
        };

        let pool = BufferPool::new(&config);
        let regions = RegionCache::new(&config, Arc::clone(&pool));
        let scheduler = Scheduler::new(config.worker_threads)?;

        tracing::info!(
            dir = %config.dir.display(),
            workers = config.worker_threads,
            region_cache_capacity = config.region_cache_capacity,
            "Opened chunk store"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                pool,
                regions,
                locks: ChunkLocks::new(),
                pending: Mutex::new(PendingWrites::new()),
                stats: StoreStats::default(),
            }),
            scheduler,
            session: Mutex::new(session),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState("chunk store is shut down".to_string()));
        }
        Ok(())
    }

    /// True if the chunk is pending or stored on disk.
    pub fn exists(&self, x: i32, z: i32) -> Result<bool> {
        self.ensure_open()?;
        let pos = ChunkPos::new(x, z);
        if self.inner.pending.lock()?.contains(pos) {
            return Ok(true);
        }

        match self.inner.regions.get_if_exists(pos)? {
            Some(region) => region.exists(pos),
            None => Ok(false),
        }
    }

    /// The newest saved payload for the chunk, from memory if it has not
    /// reached the disk yet.
    pub fn load(&self, x: i32, z: i32) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let pos = ChunkPos::new(x, z);
        let pending = self.inner.pending.lock()?.get(pos);
        if let Some(payload) = pending {
            self.inner.stats.loads_from_memory.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(payload.to_vec()));
        }

        let Some(region) = self.inner.regions.get_if_exists(pos)? else {
            return Ok(None);
        };
        let Some(mut reader) = region.read(pos)? else {
            return Ok(None);
        };

        let mut payload = Vec::new();
        reader
            .read_to_end(&mut payload)
            .map_err(|e| Error::ReadError("chunk payload", e))?;
        self.inner.stats.loads_from_disk.fetch_add(1, Ordering::Relaxed);
        Ok(Some(payload))
    }

    /// Queues `payload` for the chunk and returns without touching the disk.
    ///
    /// Fails only when the payload exceeds `max_payload_size`; write errors
    /// on the flush path are logged, not returned.
    pub fn save(&self, x: i32, z: i32, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let limit = self.inner.config.max_payload_size;
        if payload.len() > limit {
            return Err(Error::RecordTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let pos = ChunkPos::new(x, z);
        let newly_queued = self.inner.pending.lock()?.insert(pos, Arc::from(payload));
        self.inner.stats.saves.fetch_add(1, Ordering::Relaxed);
        if !newly_queued {
            self.inner.stats.coalesced_saves.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.scheduler
            .enqueue(Arc::new(FlushTask::new(Arc::clone(&self.inner))))
    }

    /// Writes every pending chunk and waits for in-flight flushes.
    pub fn flush_all(&self) -> Result<()> {
        loop {
            while self.inner.flush_one()? {}
            self.scheduler.drain()?;
            if self.inner.pending.lock()?.is_empty() {
                return Ok(());
            }
        }
    }

    /// Flushes everything, stops the workers, closes every region file and
    /// releases the session lock. Later calls are no-ops.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.flush_all()?;
        self.scheduler.shutdown()?;
        self.inner.regions.close_all()?;
        self.session.lock()?.take();

        tracing::info!(dir = %self.inner.config.dir.display(), "Chunk store shut down");
        Ok(())
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "Chunk store shutdown failed");
        }
    }
}
