// src/region/mod.rs

//! Region files: sector-addressed storage for a 32x32 grid of chunk records.
//!
//! # File Format
//!
//! A region file is a whole number of 4096-byte sectors. The first two
//! sectors form the control region; everything after them holds records.
//!
//! ```text
//! +-----------------------+  sector 0
//! | Offset Table          |  1024 x u32 BE: (sector_number << 8) | sector_count
//! +-----------------------+  sector 1
//! | Timestamp Table       |  1024 x u32 BE: seconds since epoch (optional)
//! +-----------------------+  sector 2
//! | Record                |
//! +-----------------------+
//! | ...                   |
//! +-----------------------+
//! ```
//!
//! ## Record Format
//!
//! ```text
//! +-------------+-----------+---------------------+-------------+
//! | length: u32 | scheme:u8 | compressed payload  | zero pad    |
//! +-------------+-----------+---------------------+-------------+
//! ```
//!
//! `length` counts the scheme byte plus the payload. A record spans at most
//! 255 contiguous sectors.
//!
//! # Components
//!
//! - `header`: encoding of the offset and timestamp tables
//! - `sectors`: the used-sector bitmap and first-fit allocation
//! - `scheme`: the closed set of compression schemes
//! - `file`: `RegionFile`, the per-file allocator and record I/O
//! - `cache`: `RegionCache`, the bounded set of open region files

pub mod cache;
pub mod file;
pub mod header;
pub mod scheme;
pub mod sectors;

pub use cache::RegionCache;
pub use file::{RegionFile, WriteOutcome};
pub use header::Entry;
pub use scheme::CompressionScheme;

use std::fmt;

/// Size of one allocation unit.
pub const SECTOR_SIZE: usize = 4096;

/// Sectors reserved for the offset and timestamp tables.
pub const HEADER_SECTORS: usize = 2;

/// Largest run a single record may occupy (the count is stored in 8 bits).
pub const MAX_RECORD_SECTORS: usize = 255;

/// Bytes preceding the compressed payload: u32 length plus the scheme byte.
pub const RECORD_HEADER_SIZE: usize = 5;

/// Side length of a region in chunks.
pub const REGION_SIZE: i32 = 32;

/// Number of chunk slots per region file.
pub const CHUNKS_PER_REGION: usize = (REGION_SIZE * REGION_SIZE) as usize;

/// Minimum number of sectors appended when a file has to grow.
pub const GROWTH_SECTORS: usize = 256;

/// Coordinate of a single chunk record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The region that owns this chunk.
    pub fn region(&self) -> RegionPos {
        RegionPos::new(self.x >> 5, self.z >> 5)
    }

    /// Slot of this chunk inside its region's tables.
    pub fn local_index(&self) -> usize {
        ((self.x & 31) + (self.z & 31) * REGION_SIZE) as usize
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// Coordinate of a region file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn file_name(&self) -> String {
        format!("r.{}.{}.mca", self.x, self.z)
    }

    /// The chunk stored at `index` in this region's tables.
    pub fn chunk_at(&self, index: usize) -> ChunkPos {
        let local_x = (index % CHUNKS_PER_REGION) as i32 % REGION_SIZE;
        let local_z = (index % CHUNKS_PER_REGION) as i32 / REGION_SIZE;
        ChunkPos::new(self.x * REGION_SIZE + local_x, self.z * REGION_SIZE + local_z)
    }
}

/// Number of sectors needed to hold `len` bytes.
pub const fn sectors_for(len: usize) -> usize {
    (len + SECTOR_SIZE - 1) / SECTOR_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_of_negative_chunks() {
        assert_eq!(ChunkPos::new(0, 0).region(), RegionPos::new(0, 0));
        assert_eq!(ChunkPos::new(31, 31).region(), RegionPos::new(0, 0));
        assert_eq!(ChunkPos::new(32, -1).region(), RegionPos::new(1, -1));
        assert_eq!(ChunkPos::new(-33, -32).region(), RegionPos::new(-2, -1));
    }

    #[test]
    fn test_local_index_wraps_negative_coordinates() {
        assert_eq!(ChunkPos::new(0, 0).local_index(), 0);
        assert_eq!(ChunkPos::new(31, 0).local_index(), 31);
        assert_eq!(ChunkPos::new(0, 1).local_index(), 32);
        assert_eq!(ChunkPos::new(-1, -1).local_index(), 1023);
    }

    #[test]
    fn test_chunk_at_inverts_local_index() {
        for pos in [
            ChunkPos::new(5, 7),
            ChunkPos::new(-1, -1),
            ChunkPos::new(-40, 70),
        ] {
            assert_eq!(pos.region().chunk_at(pos.local_index()), pos);
        }
    }

    #[test]
    fn test_file_name_and_sector_math() {
        assert_eq!(RegionPos::new(-1, 2).file_name(), "r.-1.2.mca");
        assert_eq!(sectors_for(0), 0);
        assert_eq!(sectors_for(1), 1);
        assert_eq!(sectors_for(4096), 1);
        assert_eq!(sectors_for(4097), 2);
    }
}
