//! Bounded set of open region files.
//!
//! Capacity is a soft bound. A region is only evicted while no caller holds
//! a handle to it, so the number of open files can briefly exceed the
//! configured capacity while every cached file is in active use. That
//! overshoot is expected.

use super::{ChunkPos, RegionFile, RegionPos};
use crate::cache::{Cache, EvictedFn, PinnedFn};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::pool::BufferPool;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub struct RegionCache {
    dir: PathBuf,
    pool: Arc<BufferPool>,
    write_timestamps: bool,
    regions: Mutex<Cache<RegionPos, Arc<RegionFile>>>,
}

impl RegionCache {
    pub fn new(config: &StoreConfig, pool: Arc<BufferPool>) -> Self {
        let evicted_fn: EvictedFn<RegionPos, Arc<RegionFile>> =
            Box::new(|pos: RegionPos, region: Arc<RegionFile>| {
                tracing::debug!(x = pos.x, z = pos.z, "Evicting region file");
                if let Err(e) = region.close() {
                    tracing::warn!(x = pos.x, z = pos.z, error = %e, "Failed to close evicted region");
                }
            });

        // Held elsewhere means some thread is mid-operation on the file.
        let pinned_fn: PinnedFn<Arc<RegionFile>> =
            Box::new(|region: &Arc<RegionFile>| Arc::strong_count(region) > 1);

        let cache = Cache::new(
            config.region_cache_capacity,
            config.region_idle_timeout,
            Some(evicted_fn),
        )
        .with_pinned_fn(pinned_fn);

        Self {
            dir: config.region_dir(),
            pool,
            write_timestamps: config.write_timestamps,
            regions: Mutex::new(cache),
        }
    }

    pub fn path_for(&self, pos: RegionPos) -> PathBuf {
        self.dir.join(pos.file_name())
    }

    /// The region file owning `chunk`, opening (and creating) it if needed.
    pub fn get_or_open(&self, chunk: ChunkPos) -> Result<Arc<RegionFile>> {
        let pos = chunk.region();
        let mut regions = self.regions.lock()?;
        if let Some(region) = regions.get(&pos) {
            return Ok(Arc::clone(region));
        }

        std::fs::create_dir_all(&self.dir)?;
        let region = Arc::new(RegionFile::open(
            self.path_for(pos),
            pos,
            Arc::clone(&self.pool),
            self.write_timestamps,
        )?);
        regions.insert(pos, Arc::clone(&region));
        Ok(region)
    }

    /// Like [`RegionCache::get_or_open`], but never creates a file for a
    /// region that has not been written yet.
    pub fn get_if_exists(&self, chunk: ChunkPos) -> Result<Option<Arc<RegionFile>>> {
        let pos = chunk.region();
        {
            let mut regions = self.regions.lock()?;
            if let Some(region) = regions.get(&pos) {
                return Ok(Some(Arc::clone(region)));
            }
        }

        if !self.path_for(pos).exists() {
            return Ok(None);
        }
        self.get_or_open(chunk).map(Some)
    }

    pub fn contains(&self, pos: RegionPos) -> Result<bool> {
        Ok(self.regions.lock()?.contains(&pos))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.regions.lock()?.len())
    }

    /// (hits, misses) of region lookups.
    pub fn stats(&self) -> Result<(usize, usize)> {
        Ok(self.regions.lock()?.stats())
    }

    /// Closes and forgets every cached region.
    pub fn close_all(&self) -> Result<()> {
        self.regions.lock()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::REGION_SIZE;
    use std::io::{Read, Write};
    use std::time::Duration;
    use tempfile::TempDir;

    fn region_cache(dir: &TempDir, capacity: usize) -> RegionCache {
        let config = StoreConfig::new(dir.path()).region_cache_capacity(capacity);
        let pool = BufferPool::new(&config);
        RegionCache::new(&config, pool)
    }

    fn chunk_in(region_x: i32) -> ChunkPos {
        ChunkPos::new(region_x * REGION_SIZE + 1, 2)
    }

    fn store(cache: &RegionCache, pos: ChunkPos, payload: &[u8]) -> Result<()> {
        let region = cache.get_or_open(pos)?;
        let mut writer = cache.pool.writer(pos)?;
        writer.write_all(payload)?;
        writer.commit(|pos, record| region.write(pos, record))?;
        Ok(())
    }

    fn fetch(cache: &RegionCache, pos: ChunkPos) -> Result<Option<Vec<u8>>> {
        let region = cache.get_or_open(pos)?;
        let Some(mut reader) = region.read(pos)? else {
            return Ok(None);
        };
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(Some(out))
    }

    #[test]
    fn test_capacity_evicts_least_recent_region() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let cache = region_cache(&dir, 2);
        let (a, b, c) = (chunk_in(0), chunk_in(1), chunk_in(2));

        let payload = b"stored in region A".to_vec();
        store(&cache, a, &payload)?;

        cache.get_or_open(b)?;
        cache.get_or_open(c)?;

        assert!(!cache.contains(a.region())?);
        assert!(cache.contains(b.region())?);
        assert!(cache.contains(c.region())?);

        // Transparent reopen with the same data.
        assert_eq!(fetch(&cache, a)?, Some(payload));
        Ok(())
    }

    #[test]
    fn test_evicted_region_is_closed() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let cache = region_cache(&dir, 1);

        let first = cache.get_or_open(chunk_in(0))?;
        let weak = Arc::downgrade(&first);
        drop(first);
        cache.get_or_open(chunk_in(1))?;

        assert!(weak.upgrade().is_none(), "evicted region should be dropped");
        assert_eq!(cache.len()?, 1);
        Ok(())
    }

    #[test]
    fn test_held_region_is_not_evicted() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let cache = region_cache(&dir, 1);

        let held = cache.get_or_open(chunk_in(0))?;
        cache.get_or_open(chunk_in(1))?;

        assert_eq!(cache.len()?, 2, "held region keeps the cache over capacity");
        assert!(!held.is_closed());
        drop(held);

        cache.get_or_open(chunk_in(2))?;
        assert_eq!(cache.len()?, 1);
        Ok(())
    }

    #[test]
    fn test_idle_regions_are_reclaimed_past_capacity() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = StoreConfig::new(dir.path())
            .region_cache_capacity(2)
            .region_idle_timeout(Duration::from_millis(20));
        let cache = RegionCache::new(&config, BufferPool::new(&config));

        cache.get_or_open(chunk_in(0))?;
        cache.get_or_open(chunk_in(1))?;
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.len()?, 2, "idle regions stay while under capacity");

        cache.get_or_open(chunk_in(2))?;
        assert!(!cache.contains(chunk_in(0).region())?);
        assert!(!cache.contains(chunk_in(1).region())?);
        assert_eq!(cache.len()?, 1);
        Ok(())
    }

    #[test]
    fn test_get_if_exists_does_not_create_files() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let cache = region_cache(&dir, 4);
        let pos = chunk_in(5);

        assert!(cache.get_if_exists(pos)?.is_none());
        assert!(!cache.path_for(pos.region()).exists());

        cache.get_or_open(pos)?;
        cache.close_all()?;
        assert_eq!(cache.len()?, 0);
        assert!(cache.get_if_exists(pos)?.is_some());

        let (hits, misses) = cache.stats()?;
        assert!(misses >= 2);
        assert!(hits <= 1);
        Ok(())
    }
}
