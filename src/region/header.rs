use crate::error::Result;
use crate::Error;

use super::{CHUNKS_PER_REGION, HEADER_SECTORS, MAX_RECORD_SECTORS, SECTOR_SIZE};

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

/// Size of the control region at the start of every region file.
pub const HEADER_SIZE: usize = HEADER_SECTORS * SECTOR_SIZE;

/// Byte offset of the timestamp table.
pub const TIMESTAMP_TABLE_OFFSET: u64 = SECTOR_SIZE as u64;

/// One offset table word, unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Entry {
    pub sector_number: u32,
    pub sector_count: u8,
}

impl Entry {
    pub const ABSENT: Entry = Entry {
        sector_number: 0,
        sector_count: 0,
    };

    pub fn new(sector_number: usize, sector_count: usize) -> Self {
        debug_assert!(sector_count <= MAX_RECORD_SECTORS);
        debug_assert!(sector_number < 1 << 24);
        Entry {
            sector_number: sector_number as u32,
            sector_count: sector_count as u8,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.pack() == 0
    }

    pub fn start(&self) -> usize {
        self.sector_number as usize
    }

    pub fn len(&self) -> usize {
        self.sector_count as usize
    }

    pub fn end(&self) -> usize {
        self.start() + self.len()
    }

    pub fn pack(&self) -> u32 {
        (self.sector_number << 8) | self.sector_count as u32
    }

    pub fn unpack(word: u32) -> Self {
        Entry {
            sector_number: word >> 8,
            sector_count: (word & 0xFF) as u8,
        }
    }
}

/// The offset and timestamp tables of a region file.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub entries: Vec<Entry>,
    pub timestamps: Vec<u32>,
}

impl Header {
    pub fn new() -> Self {
        Header {
            entries: vec![Entry::ABSENT; CHUNKS_PER_REGION],
            timestamps: vec![0; CHUNKS_PER_REGION],
        }
    }

    /// Byte offset of the offset table word for `index`.
    pub fn entry_offset(index: usize) -> u64 {
        (index * 4) as u64
    }

    /// Byte offset of the timestamp word for `index`.
    pub fn timestamp_offset(index: usize) -> u64 {
        TIMESTAMP_TABLE_OFFSET + (index * 4) as u64
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<&[u8]> for Header {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }

        HeaderDecoder::new(&bytes[..HEADER_SIZE]).decode()
    }
}

pub struct HeaderDecoder<R: Read> {
    reader: R,
}

impl<R: Read> HeaderDecoder<R> {
    pub fn new(reader: R) -> Self {
        HeaderDecoder { reader }
    }

    pub fn decode(&mut self) -> Result<Header> {
        let mut header = Header::new();

        for entry in header.entries.iter_mut() {
            let word = self
                .reader
                .read_u32::<BigEndian>()
                .map_err(|e| Error::ReadError("offset table", e))?;
            *entry = Entry::unpack(word);
        }

        for timestamp in header.timestamps.iter_mut() {
            *timestamp = self
                .reader
                .read_u32::<BigEndian>()
                .map_err(|e| Error::ReadError("timestamp table", e))?;
        }

        Ok(header)
    }
}
