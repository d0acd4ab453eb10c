//! A sector-addressed chunk store.
//!
//! Chunks are keyed by `(x, z)` and grouped 32x32 into region files made of
//! 4096-byte sectors. Saves are buffered in memory and written by a small
//! pool of worker threads; loads see pending saves before the disk.
//!
//! ```no_run
//! use regionstore::{ChunkStore, StoreConfig};
//!
//! # fn main() -> regionstore::Result<()> {
//! let store = ChunkStore::open(StoreConfig::new("./world"))?;
//! store.save(4, -2, b"chunk bytes".to_vec())?;
//! assert_eq!(store.load(4, -2)?, Some(b"chunk bytes".to_vec()));
//! store.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod flock;
pub mod lock;
pub mod pool;
pub mod region;
pub mod scheduler;
pub mod store;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use region::{ChunkPos, RegionPos};
pub use store::{ChunkStore, StatsSnapshot};
