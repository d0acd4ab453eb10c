// src/region/file.rs

//! A single region file: the sector allocator plus record I/O.
//!
//! The offset table, used-sector bitmap and per-slot scheme cache are kept
//! in memory and mutated together under the file's own mutex, so `exists`,
//! `read` and `write` on one file are strictly serialized. Nothing here
//! orders operations across different files.

use super::header::{Entry, Header, HEADER_SIZE};
use super::sectors::SectorBitmap;
use super::{
    sectors_for, ChunkPos, CompressionScheme, RegionPos, CHUNKS_PER_REGION, GROWTH_SECTORS,
    HEADER_SECTORS, MAX_RECORD_SECTORS, RECORD_HEADER_SIZE, SECTOR_SIZE,
};
use crate::error::Result;
use crate::pool::{BufferPool, ChunkReader, Pooled};
use crate::Error;

use byteorder::{BigEndian, WriteBytesExt};

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

const ZERO_SECTOR: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

/// What a call to [`RegionFile::write`] did with the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Same sector count as before: rewritten where it was, table untouched.
    Overwritten(Entry),
    /// Moved to the first free run that fits.
    Relocated(Entry),
    /// No run fit; the file was extended and the record placed at the old end.
    Appended(Entry),
    /// The record needs more than 255 sectors and was not written.
    TooLarge { sectors: usize },
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        !matches!(self, WriteOutcome::TooLarge { .. })
    }
}

/// Byte storage under a region file. Implemented by `File`; tests wrap it to
/// inject I/O failures.
pub(crate) trait RegionStorage: Read + Write + Seek + Send {
    fn len(&self) -> io::Result<u64>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
    fn sync_data(&self) -> io::Result<()>;
}

impl RegionStorage for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync_data(&self) -> io::Result<()> {
        File::sync_data(self)
    }
}

/// What is known about a slot's record beyond its offset entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unchecked,
    Readable(CompressionScheme),
    Corrupt,
}

struct Inner {
    file: Option<Box<dyn RegionStorage>>,
    header: Header,
    sectors: SectorBitmap,
    slots: Vec<Slot>,
    /// Record pre-read by `exists`, handed to the next matching `read`.
    prefetched: Option<Pooled<ChunkReader>>,
}

impl Inner {
    fn file(&mut self) -> Result<&mut dyn RegionStorage> {
        match self.file.as_deref_mut() {
            Some(file) => Ok(file),
            None => Err(Error::Closed),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.file {
            Some(_) => Ok(()),
            None => Err(Error::Closed),
        }
    }

    /// The slot's entry if it points at a usable range inside the file.
    fn live_entry(&self, index: usize) -> Option<Entry> {
        let entry = self.header.entries[index];
        let usable = !entry.is_absent()
            && entry.len() > 0
            && entry.start() >= HEADER_SECTORS
            && entry.end() <= self.sectors.len();
        usable.then_some(entry)
    }

    fn take_prefetched(&mut self, pos: ChunkPos) -> Option<Pooled<ChunkReader>> {
        match &self.prefetched {
            Some(reader) if reader.pos() == Some(pos) => self.prefetched.take(),
            _ => None,
        }
    }
}

pub struct RegionFile {
    pos: RegionPos,
    path: PathBuf,
    pool: Arc<BufferPool>,
    write_timestamps: bool,
    inner: Mutex<Inner>,
}

impl RegionFile {
    /// Opens or creates the region file at `path`.
    ///
    /// New or short files get a zeroed control region; files whose length
    /// is not a whole number of sectors are padded.
    pub fn open(
        path: impl AsRef<Path>,
        pos: RegionPos,
        pool: Arc<BufferPool>,
        write_timestamps: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Self::with_storage(path, pos, pool, write_timestamps, Box::new(file))
    }

    pub(crate) fn with_storage(
        path: PathBuf,
        pos: RegionPos,
        pool: Arc<BufferPool>,
        write_timestamps: bool,
        mut file: Box<dyn RegionStorage>,
    ) -> Result<Self> {
        let mut len = file.len()? as usize;
        if len < HEADER_SIZE {
            file.set_len(HEADER_SIZE as u64)?;
            len = HEADER_SIZE;
        }
        if len % SECTOR_SIZE != 0 {
            len = sectors_for(len) * SECTOR_SIZE;
            file.set_len(len as u64)?;
        }

        let mut header_bytes = vec![0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_bytes)
            .map_err(|e| Error::ReadError("region header", e))?;
        let header = Header::try_from(header_bytes.as_slice())?;

        let mut sectors = SectorBitmap::new(len / SECTOR_SIZE);
        for (index, entry) in header.entries.iter().enumerate() {
            if entry.is_absent() {
                continue;
            }
            let chunk = pos.chunk_at(index);
            if entry.len() == 0 || entry.start() < HEADER_SECTORS || entry.end() > sectors.len() {
                tracing::warn!(
                    region = %path.display(),
                    x = chunk.x,
                    z = chunk.z,
                    sector = entry.sector_number,
                    count = entry.sector_count,
                    "Ignoring offset entry outside the file"
                );
                continue;
            }
            if (entry.start()..entry.end()).any(|s| sectors.is_used(s)) {
                tracing::warn!(
                    region = %path.display(),
                    x = chunk.x,
                    z = chunk.z,
                    "Record overlaps another record"
                );
            }
            sectors.set_range(entry.start(), entry.len(), true);
        }

        tracing::debug!(
            region = %path.display(),
            sectors = sectors.len(),
            used = sectors.used_count(),
            "Opened region file"
        );

        Ok(Self {
            pos,
            path,
            pool,
            write_timestamps,
            inner: Mutex::new(Inner {
                file: Some(file),
                header,
                sectors,
                slots: vec![Slot::Unchecked; CHUNKS_PER_REGION],
                prefetched: None,
            }),
        })
    }

    pub fn pos(&self) -> RegionPos {
        self.pos
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.inner.lock()?;
        inner.ensure_open()?;
        Ok(inner)
    }

    /// True if `pos` has a readable record.
    ///
    /// The first check of a slot reads the record into a pooled reader and
    /// keeps it for the `read` that usually follows.
    pub fn exists(&self, pos: ChunkPos) -> Result<bool> {
        let mut inner = self.lock()?;
        let index = pos.local_index();

        let Some(entry) = inner.live_entry(index) else {
            return Ok(false);
        };

        match inner.slots[index] {
            Slot::Readable(_) => return Ok(true),
            Slot::Corrupt => return Ok(false),
            Slot::Unchecked => {}
        }

        match self.read_record(&mut inner, pos, entry)? {
            Some(reader) => {
                inner.prefetched = Some(reader);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns a decompressing reader positioned on the record's payload, or
    /// `None` if the slot is empty or holds a corrupt record.
    pub fn read(&self, pos: ChunkPos) -> Result<Option<Pooled<ChunkReader>>> {
        let mut inner = self.lock()?;

        if let Some(reader) = inner.take_prefetched(pos) {
            return Ok(Some(reader));
        }

        let index = pos.local_index();
        let Some(entry) = inner.live_entry(index) else {
            return Ok(None);
        };
        if inner.slots[index] == Slot::Corrupt {
            return Ok(None);
        }

        self.read_record(&mut inner, pos, entry)
    }

    fn read_record(
        &self,
        inner: &mut Inner,
        pos: ChunkPos,
        entry: Entry,
    ) -> Result<Option<Pooled<ChunkReader>>> {
        let mut reader = self.pool.reader();
        let file = inner.file()?;
        file.seek(SeekFrom::Start((entry.start() * SECTOR_SIZE) as u64))?;
        file.read_exact(reader.buffer_mut(entry.len() * SECTOR_SIZE))
            .map_err(|e| Error::ReadError("record sectors", e))?;

        let index = pos.local_index();
        match reader.bake(pos) {
            Ok(()) => {
                inner.slots[index] = Slot::Readable(reader.scheme());
                Ok(Some(reader))
            }
            Err(Error::CorruptRecord(msg)) => {
                tracing::warn!(region = %self.path.display(), x = pos.x, z = pos.z, "{}", msg);
                inner.slots[index] = Slot::Corrupt;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes a framed record (length, scheme byte, payload) for `pos`.
    ///
    /// A record that needs exactly as many sectors as the slot already has
    /// is rewritten in place. Otherwise the old run is released and the
    /// record goes to the first free run that fits, growing the file by
    /// `max(needed, 256)` sectors when none does.
    pub fn write(&self, pos: ChunkPos, record: &[u8]) -> Result<WriteOutcome> {
        if record.len() < RECORD_HEADER_SIZE {
            return Err(Error::InvalidState(format!(
                "record for {} is only {} bytes",
                pos,
                record.len()
            )));
        }

        let needed = sectors_for(record.len());
        if needed > MAX_RECORD_SECTORS {
            tracing::warn!(
                region = %self.path.display(),
                x = pos.x,
                z = pos.z,
                sectors = needed,
                "Dropping record larger than {} sectors",
                MAX_RECORD_SECTORS
            );
            return Ok(WriteOutcome::TooLarge { sectors: needed });
        }

        let mut inner = self.lock()?;
        let index = pos.local_index();
        if inner.take_prefetched(pos).is_some() {
            tracing::trace!(x = pos.x, z = pos.z, "Discarded stale pre-read");
        }

        let current = inner.live_entry(index);
        if let Some(entry) = current.filter(|entry| entry.len() == needed) {
            if let Err(e) = Self::write_sectors(inner.file()?, entry, record) {
                // The run may be half rewritten; check it again on next access.
                inner.slots[index] = Slot::Unchecked;
                return Err(e);
            }
            inner.slots[index] = Self::slot_for(record);
            return Ok(WriteOutcome::Overwritten(entry));
        }

        // Until the sectors and the table word are on disk the old entry
        // stays live and its run stays reserved.
        let (target, growth) = Self::place(&mut inner.sectors, current, needed);
        let outcome = match growth {
            Some(growth) => {
                inner
                    .file()?
                    .set_len(((target.start() + growth) * SECTOR_SIZE) as u64)
                    .map_err(|e| Error::WriteError("region growth", e))?;
                inner.sectors.grow(growth);
                WriteOutcome::Appended(target)
            }
            None => WriteOutcome::Relocated(target),
        };

        // The target may overlap the old run, so the cached scheme is stale
        // until the commit below.
        inner.slots[index] = Slot::Unchecked;
        Self::write_sectors(inner.file()?, target, record)?;

        let stamp = if self.write_timestamps {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
            let file = inner.file()?;
            file.seek(SeekFrom::Start(Header::timestamp_offset(index)))?;
            file.write_u32::<BigEndian>(now)
                .map_err(|e| Error::WriteError("timestamp table", e))?;
            Some(now)
        } else {
            None
        };

        let file = inner.file()?;
        file.seek(SeekFrom::Start(Header::entry_offset(index)))?;
        file.write_u32::<BigEndian>(target.pack())
            .map_err(|e| Error::WriteError("offset table", e))?;

        if let Some(old) = current {
            inner.sectors.set_range(old.start(), old.len(), false);
        }
        inner.sectors.set_range(target.start(), target.len(), true);
        inner.header.entries[index] = target;
        if let Some(now) = stamp {
            inner.header.timestamps[index] = now;
        }
        inner.slots[index] = Self::slot_for(record);

        tracing::debug!(
            x = pos.x,
            z = pos.z,
            sector = target.sector_number,
            count = target.sector_count,
            "Allocated record"
        );
        Ok(outcome)
    }

    /// First-fit placement for `needed` sectors, counting the slot's current
    /// run as free. Returns the target and, when nothing fits, how many
    /// sectors the file must grow by. The bitmap is left as it was.
    fn place(
        sectors: &mut SectorBitmap,
        current: Option<Entry>,
        needed: usize,
    ) -> (Entry, Option<usize>) {
        if let Some(old) = current {
            sectors.set_range(old.start(), old.len(), false);
        }
        let start = sectors.find_free_run(needed);
        if let Some(old) = current {
            sectors.set_range(old.start(), old.len(), true);
        }

        match start {
            Some(start) => (Entry::new(start, needed), None),
            None => (
                Entry::new(sectors.len(), needed),
                Some(needed.max(GROWTH_SECTORS)),
            ),
        }
    }

    fn slot_for(record: &[u8]) -> Slot {
        let scheme = CompressionScheme::from(record[4]);
        if scheme.is_known() {
            Slot::Readable(scheme)
        } else {
            Slot::Corrupt
        }
    }

    fn write_sectors(file: &mut dyn RegionStorage, target: Entry, record: &[u8]) -> Result<()> {
        file.seek(SeekFrom::Start((target.start() * SECTOR_SIZE) as u64))?;
        file.write_all(record)
            .map_err(|e| Error::WriteError("record sectors", e))?;

        let mut padding = target.len() * SECTOR_SIZE - record.len();
        while padding > 0 {
            let n = padding.min(SECTOR_SIZE);
            file.write_all(&ZERO_SECTOR[..n])
                .map_err(|e| Error::WriteError("record padding", e))?;
            padding -= n;
        }
        Ok(())
    }

    /// The decoded offset table entry for `pos`.
    pub fn entry(&self, pos: ChunkPos) -> Result<Entry> {
        let inner = self.lock()?;
        Ok(inner.header.entries[pos.local_index()])
    }

    /// Seconds-since-epoch stamp for `pos`, 0 if never stamped.
    pub fn timestamp(&self, pos: ChunkPos) -> Result<u32> {
        let inner = self.lock()?;
        Ok(inner.header.timestamps[pos.local_index()])
    }

    /// Chunks with a live offset entry, in table order.
    pub fn stored_chunks(&self) -> Result<Vec<ChunkPos>> {
        let inner = self.lock()?;
        Ok((0..CHUNKS_PER_REGION)
            .filter(|&index| inner.live_entry(index).is_some())
            .map(|index| self.pos.chunk_at(index))
            .collect())
    }

    /// Current file length in sectors.
    pub fn sector_count(&self) -> Result<usize> {
        Ok(self.lock()?.sectors.len())
    }

    /// Sectors currently claimed, including the control region.
    pub fn used_sectors(&self) -> Result<usize> {
        Ok(self.lock()?.sectors.used_count())
    }

    pub fn is_closed(&self) -> bool {
        match self.inner.lock() {
            Ok(inner) => inner.file.is_none(),
            Err(_) => true,
        }
    }

    /// Syncs and releases the file handle. Every later operation fails with
    /// `Error::Closed`; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.prefetched = None;
        if let Some(file) = inner.file.take() {
            file.sync_data()
                .map_err(|e| Error::WriteError("region sync", e))?;
            tracing::debug!(region = %self.path.display(), "Closed region file");
        }
        Ok(())
    }
}
