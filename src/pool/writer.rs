use crate::error::Result;
use crate::region::{ChunkPos, CompressionScheme, RECORD_HEADER_SIZE};
use crate::Error;

use flate2::write::ZlibEncoder;

use std::io::{self, Write};

use super::Recycle;

/// Compressing writer that frames its output as a complete region record.
///
/// The backing buffer always starts with a 5-byte placeholder for the
/// record header, which [`ChunkWriter::commit`] fills in once the deflate
/// stream is finished.
pub struct ChunkWriter {
    encoder: ZlibEncoder<Vec<u8>>,
    pos: Option<ChunkPos>,
    capacity: usize,
}

impl ChunkWriter {
    pub fn new(level: u32, capacity: usize) -> Self {
        Self {
            encoder: ZlibEncoder::new(Vec::new(), CompressionScheme::level(level)),
            pos: None,
            capacity,
        }
    }

    /// The chunk this writer currently belongs to.
    pub fn pos(&self) -> Option<ChunkPos> {
        self.pos
    }

    /// Rewinds the buffer to just past the header and resets the deflate
    /// state, claiming the writer for `pos`.
    pub fn begin(&mut self, pos: ChunkPos) -> Result<()> {
        let mut buf = std::mem::take(self.encoder.get_mut());
        if buf.capacity() == 0 {
            buf.reserve(self.capacity);
        }
        buf.clear();
        buf.extend_from_slice(&[0u8; RECORD_HEADER_SIZE]);

        // Finishes whatever stream was in flight into the empty placeholder
        // left by `take`, then swaps our framed buffer back in.
        self.encoder
            .reset(buf)
            .map_err(|e| Error::WriteError("deflate reset", e))?;
        self.pos = Some(pos);
        Ok(())
    }

    /// Finishes the deflate stream, writes the big-endian length and scheme
    /// into the header placeholder, and hands the framed record to `write`.
    ///
    /// The writer gives up its owner before `write` runs, so a failed write
    /// cannot leave it attached to the chunk.
    pub fn commit<T, F>(&mut self, write: F) -> Result<T>
    where
        F: FnOnce(ChunkPos, &[u8]) -> Result<T>,
    {
        let pos = self.pos.take().ok_or_else(|| {
            Error::InvalidState("commit on a writer that was never begun".to_string())
        })?;

        self.encoder
            .try_finish()
            .map_err(|e| Error::WriteError("deflate stream", e))?;

        let record = self.encoder.get_mut();
        let length = (record.len() - 4) as u32;
        record[0..4].copy_from_slice(&length.to_be_bytes());
        record[4] = CompressionScheme::Deflate.tag();

        write(pos, record)
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.pos.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "chunk writer has no owner",
            ));
        }
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

impl Recycle for ChunkWriter {
    fn recycle(&mut self) {
        self.pos = None;
        if self.encoder.get_ref().capacity() > self.capacity {
            *self.encoder.get_mut() = Vec::new();
        }
    }
}
