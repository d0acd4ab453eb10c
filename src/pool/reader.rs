use crate::error::Result;
use crate::region::{ChunkPos, CompressionScheme, RECORD_HEADER_SIZE};
use crate::Error;

use byteorder::{BigEndian, ByteOrder};
use flate2::read::GzDecoder;
use flate2::{Decompress, FlushDecompress, Status};

use std::io::{self, Read};

use super::Recycle;

/// Decompressing view over a record read straight from its sectors.
///
/// The caller fills the backing buffer with raw sector bytes through
/// [`ChunkReader::buffer_mut`], then calls [`ChunkReader::bake`] to validate
/// the record header and position the cursor on the compressed payload.
pub struct ChunkReader {
    buf: Vec<u8>,
    /// One past the last payload byte (4 + record length).
    end: usize,
    cursor: usize,
    inflate: Decompress,
    /// Gzip records are inflated whole into this buffer on first read.
    inflated: Vec<u8>,
    inflated_pos: usize,
    gzip_inflated: bool,
    scheme: CompressionScheme,
    finished: bool,
    pos: Option<ChunkPos>,
    capacity: usize,
}

impl ChunkReader {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            end: 0,
            cursor: 0,
            inflate: Decompress::new(true),
            inflated: Vec::new(),
            inflated_pos: 0,
            gzip_inflated: false,
            scheme: CompressionScheme::Deflate,
            finished: true,
            pos: None,
            capacity,
        }
    }

    /// The chunk this reader was last baked for, if it still holds one.
    pub fn pos(&self) -> Option<ChunkPos> {
        self.pos
    }

    pub fn scheme(&self) -> CompressionScheme {
        self.scheme
    }

    /// Resizes the backing buffer to `len` zeroed bytes and hands it out for
    /// filling. Any previously baked record is discarded.
    pub fn buffer_mut(&mut self, len: usize) -> &mut [u8] {
        self.pos = None;
        self.finished = true;
        self.buf.clear();
        self.buf.resize(len, 0);
        &mut self.buf[..]
    }

    /// Validates the record header in the backing buffer and prepares the
    /// payload for reading.
    ///
    /// Fails with `CorruptRecord` when the length is zero, runs past the
    /// buffer, or the scheme byte is not recognized. The payload itself is
    /// only decompressed when read, so a damaged stream surfaces as a read
    /// error for either scheme.
    pub fn bake(&mut self, pos: ChunkPos) -> Result<()> {
        if self.buf.len() < RECORD_HEADER_SIZE {
            return Err(Error::CorruptRecord(format!(
                "chunk {} has only {} bytes",
                pos,
                self.buf.len()
            )));
        }

        let length = BigEndian::read_u32(&self.buf[0..4]) as usize;
        if length == 0 || 4 + length > self.buf.len() {
            return Err(Error::CorruptRecord(format!(
                "chunk {} declares length {} in {} bytes of sectors",
                pos,
                length,
                self.buf.len()
            )));
        }

        let scheme = CompressionScheme::from(self.buf[4]);
        if !scheme.is_known() {
            return Err(Error::CorruptRecord(format!(
                "chunk {} has unknown compression scheme {}",
                pos,
                scheme.tag()
            )));
        }

        self.end = 4 + length;
        self.cursor = RECORD_HEADER_SIZE;
        self.scheme = scheme;
        self.finished = false;
        self.inflate.reset(true);
        self.inflated.clear();
        self.inflated_pos = 0;
        self.gzip_inflated = false;

        self.pos = Some(pos);
        Ok(())
    }

    fn read_deflate(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            let input = &self.buf[self.cursor..self.end];
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();

            let status = self
                .inflate
                .decompress(input, out, FlushDecompress::None)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;
            self.cursor += consumed;

            if status == Status::StreamEnd {
                self.finished = true;
                return Ok(produced);
            }
            if produced > 0 {
                return Ok(produced);
            }
            if self.cursor >= self.end {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "record ends inside the deflate stream",
                ));
            }
            if consumed == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "deflate stream made no progress",
                ));
            }
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.finished {
            return Ok(0);
        }

        match self.scheme {
            CompressionScheme::Deflate => self.read_deflate(out),
            CompressionScheme::Gzip => {
                if !self.gzip_inflated {
                    GzDecoder::new(&self.buf[RECORD_HEADER_SIZE..self.end])
                        .read_to_end(&mut self.inflated)?;
                    self.gzip_inflated = true;
                }
                let remaining = &self.inflated[self.inflated_pos..];
                let n = remaining.len().min(out.len());
                out[..n].copy_from_slice(&remaining[..n]);
                self.inflated_pos += n;
                if self.inflated_pos == self.inflated.len() {
                    self.finished = true;
                }
                Ok(n)
            }
            CompressionScheme::Unknown(tag) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown compression scheme {}", tag),
            )),
        }
    }
}

impl Recycle for ChunkReader {
    fn recycle(&mut self) {
        self.pos = None;
        self.finished = true;
        self.cursor = 0;
        self.end = 0;
        if self.buf.capacity() > self.capacity {
            self.buf = Vec::new();
        }
        self.inflated.clear();
        self.gzip_inflated = false;
        if self.inflated.capacity() > self.capacity {
            self.inflated = Vec::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn framed(scheme: u8, compressed: &[u8], sectors_len: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((compressed.len() + 1) as u32).to_be_bytes());
        bytes.push(scheme);
        bytes.extend_from_slice(compressed);
        bytes.resize(sectors_len.max(bytes.len()), 0);
        bytes
    }

    fn zlib(payload: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    fn fill(reader: &mut ChunkReader, bytes: &[u8]) {
        reader.buffer_mut(bytes.len()).copy_from_slice(bytes);
    }

    #[test]
    fn test_reads_deflate_record_with_padding() {
        let payload = b"a chunk payload that compresses ".repeat(50);
        let bytes = framed(2, &zlib(&payload), 4096);

        let mut reader = ChunkReader::new(1024);
        fill(&mut reader, &bytes);
        reader.bake(ChunkPos::new(1, 2)).expect("bake");
        assert_eq!(reader.pos(), Some(ChunkPos::new(1, 2)));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("inflate");
        assert_eq!(out, payload);
    }

    #[test]
    fn test_reads_legacy_gzip_record() {
        let payload = b"legacy".repeat(100);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).unwrap();
        let bytes = framed(1, &encoder.finish().unwrap(), 4096);

        let mut reader = ChunkReader::new(1024);
        fill(&mut reader, &bytes);
        reader.bake(ChunkPos::new(0, 0)).expect("bake");
        assert_eq!(reader.scheme(), CompressionScheme::Gzip);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read gzip");
        assert_eq!(out, payload);
    }

    #[test]
    fn test_corrupt_gzip_body_fails_on_read() {
        let bytes = framed(1, &[0x1f, 0x8b, 0xff, 0x00, 0x13, 0x37], 4096);

        let mut reader = ChunkReader::new(1024);
        fill(&mut reader, &bytes);
        reader.bake(ChunkPos::new(0, 0)).expect("header is valid");

        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_rejects_bad_headers() {
        let mut reader = ChunkReader::new(1024);

        let unknown = framed(7, &zlib(b"x"), 64);
        fill(&mut reader, &unknown);
        assert!(matches!(reader.bake(ChunkPos::new(0, 0)), Err(Error::CorruptRecord(_))));

        let mut zero_length = framed(2, &zlib(b"x"), 64);
        zero_length[0..4].copy_from_slice(&0u32.to_be_bytes());
        fill(&mut reader, &zero_length);
        assert!(matches!(reader.bake(ChunkPos::new(0, 0)), Err(Error::CorruptRecord(_))));

        let mut too_long = framed(2, &zlib(b"x"), 64);
        too_long[0..4].copy_from_slice(&64u32.to_be_bytes());
        fill(&mut reader, &too_long);
        assert!(matches!(reader.bake(ChunkPos::new(0, 0)), Err(Error::CorruptRecord(_))));
        assert_eq!(reader.pos(), None);
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let payload: Vec<u8> = (0..4000u32).map(|i| (i * 7919 % 251) as u8).collect();
        let compressed = zlib(&payload);
        let truncated = &compressed[..compressed.len() / 2];
        let bytes = framed(2, truncated, 0);

        let mut reader = ChunkReader::new(1024);
        fill(&mut reader, &bytes);
        reader.bake(ChunkPos::new(0, 0)).expect("header is valid");

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).expect_err("truncated");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_recycle_trims_oversized_buffers() {
        let mut reader = ChunkReader::new(16);
        reader.buffer_mut(4096);
        reader.recycle();
        assert_eq!(reader.buf.capacity(), 0);
        assert_eq!(reader.pos(), None);

        let mut reader = ChunkReader::new(8192);
        reader.buffer_mut(4096);
        reader.recycle();
        assert!(reader.buf.capacity() >= 4096);
    }
}
