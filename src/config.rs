use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a chunk store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Save root; region files live under `dir/region` (default: ./world)
    pub dir: PathBuf,

    /// Number of background flush workers (default: 2).
    /// With 0 workers nothing is flushed until `flush_all` is called.
    pub worker_threads: usize,

    /// Soft bound on simultaneously open region files (default: 256)
    pub region_cache_capacity: usize,

    /// A cached region untouched for this long is reclaimed first (default: 5m)
    pub region_idle_timeout: Duration,

    /// Deflate level used for new records, 0-9 (default: 4)
    pub compression_level: u32,

    /// Initial size of pooled record buffers (default: 32KB)
    pub buffer_capacity: usize,

    /// Maximum number of idle readers/writers kept per pool (default: 64)
    pub pool_capacity: usize,

    /// Stamp the timestamp table on every relocation (default: false)
    pub write_timestamps: bool,

    /// Largest uncompressed payload `save` accepts (default: 32MB)
    pub max_payload_size: usize,

    /// Hold an exclusive lock on `dir/session.lock` (default: true)
    pub session_lock: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./world"),
            worker_threads: 2,
            region_cache_capacity: 256,
            region_idle_timeout: Duration::from_secs(5 * 60),
            compression_level: 4,
            buffer_capacity: 32 * 1024, // 32KB
            pool_capacity: 64,
            write_timestamps: false,
            max_payload_size: 32 * 1024 * 1024, // 32MB
            session_lock: true,
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given save root
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Directory holding the `r.<x>.<z>.mca` files
    pub fn region_dir(&self) -> PathBuf {
        self.dir.join("region")
    }

    /// Set the number of flush workers
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Set the region cache capacity
    pub fn region_cache_capacity(mut self, capacity: usize) -> Self {
        self.region_cache_capacity = capacity;
        self
    }

    /// Set the idle timeout after which cached regions are reclaimed
    pub fn region_idle_timeout(mut self, timeout: Duration) -> Self {
        self.region_idle_timeout = timeout;
        self
    }

    /// Set the deflate level (clamped to 9)
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    /// Set the initial pooled buffer size
    pub fn buffer_capacity(mut self, size: usize) -> Self {
        self.buffer_capacity = size;
        self
    }

    /// Set how many idle streams each pool retains
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Enable or disable the timestamp table
    pub fn write_timestamps(mut self, enabled: bool) -> Self {
        self.write_timestamps = enabled;
        self
    }

    /// Set the largest payload `save` accepts
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Enable or disable the session lock
    pub fn session_lock(mut self, enabled: bool) -> Self {
        self.session_lock = enabled;
        self
    }
}
