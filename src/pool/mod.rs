// src/pool/mod.rs

//! Pooled record streams.
//!
//! Every record read or written goes through a [`ChunkReader`] or
//! [`ChunkWriter`] borrowed from a [`BufferPool`]. Both own a growable
//! buffer plus (de)compressor state that survives between records, so the
//! steady-state read and write paths do not allocate.
//!
//! Borrowing returns a [`Pooled`] guard. Dropping the guard recycles the
//! stream (owner cleared, oversized buffers released) and pushes it back
//! onto a bounded lock-free free list; when the list is full the stream is
//! simply dropped.

mod reader;
mod writer;

pub use reader::ChunkReader;
pub use writer::ChunkWriter;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::region::ChunkPos;

use crossbeam_queue::ArrayQueue;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Resets a stream before it goes back on a free list.
pub trait Recycle {
    fn recycle(&mut self);
}

/// Streams that live on one of the pool's free lists.
pub trait PoolItem: Recycle + Sized {
    fn free_list(pool: &BufferPool) -> &ArrayQueue<Self>;
}

impl PoolItem for ChunkReader {
    fn free_list(pool: &BufferPool) -> &ArrayQueue<Self> {
        &pool.readers
    }
}

impl PoolItem for ChunkWriter {
    fn free_list(pool: &BufferPool) -> &ArrayQueue<Self> {
        &pool.writers
    }
}

pub struct BufferPool {
    readers: ArrayQueue<ChunkReader>,
    writers: ArrayQueue<ChunkWriter>,
    compression_level: u32,
    buffer_capacity: usize,
    created: AtomicUsize,
}

impl BufferPool {
    pub fn new(config: &StoreConfig) -> Arc<Self> {
        let capacity = config.pool_capacity.max(1);
        Arc::new(Self {
            readers: ArrayQueue::new(capacity),
            writers: ArrayQueue::new(capacity),
            compression_level: config.compression_level,
            buffer_capacity: config.buffer_capacity,
            created: AtomicUsize::new(0),
        })
    }

    /// Borrows a reader, allocating one if the free list is empty.
    pub fn reader(self: &Arc<Self>) -> Pooled<ChunkReader> {
        let reader = self.readers.pop().unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            ChunkReader::new(self.buffer_capacity)
        });
        Pooled::new(reader, Arc::clone(self))
    }

    /// Borrows a writer already claimed for `pos`.
    pub fn writer(self: &Arc<Self>, pos: ChunkPos) -> Result<Pooled<ChunkWriter>> {
        let writer = self.writers.pop().unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            ChunkWriter::new(self.compression_level, self.buffer_capacity)
        });
        let mut writer = Pooled::new(writer, Arc::clone(self));
        writer.begin(pos)?;
        Ok(writer)
    }

    pub fn idle_readers(&self) -> usize {
        self.readers.len()
    }

    pub fn idle_writers(&self) -> usize {
        self.writers.len()
    }

    /// Total streams ever allocated by this pool.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

/// A stream on loan from a [`BufferPool`]; returned on drop.
pub struct Pooled<T: PoolItem> {
    /// Only `None` once `drop` has taken it.
    item: Option<T>,
    pool: Arc<BufferPool>,
}

impl<T: PoolItem> Pooled<T> {
    fn new(item: T, pool: Arc<BufferPool>) -> Self {
        Self {
            item: Some(item),
            pool,
        }
    }
}

impl<T: PoolItem> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled stream used after release")
    }
}

impl<T: PoolItem> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled stream used after release")
    }
}

impl<T: PoolItem> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut item) = self.item.take() {
            item.recycle();
            let _ = T::free_list(&self.pool).push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn pool(capacity: usize) -> Arc<BufferPool> {
        BufferPool::new(&StoreConfig::default().pool_capacity(capacity))
    }

    #[test]
    fn test_streams_return_on_drop() {
        let pool = pool(4);
        {
            let _reader = pool.reader();
            let _writer = pool.writer(ChunkPos::new(0, 0)).expect("writer");
            assert_eq!(pool.idle_readers(), 0);
            assert_eq!(pool.idle_writers(), 0);
        }
        assert_eq!(pool.idle_readers(), 1);
        assert_eq!(pool.idle_writers(), 1);

        let _reader = pool.reader();
        assert_eq!(pool.created(), 2, "second borrow reuses the pooled reader");
    }

    #[test]
    fn test_writer_is_released_on_error_path() {
        let pool = pool(4);
        let result: Result<()> = (|| {
            let mut writer = pool.writer(ChunkPos::new(1, 1))?;
            writer.write_all(b"payload")?;
            writer.commit(|_, _| Err(crate::Error::InvalidState("disk gone".into())))
        })();

        assert!(result.is_err());
        assert_eq!(pool.idle_writers(), 1);

        let writer = pool.writer(ChunkPos::new(2, 2)).expect("writer");
        assert_eq!(writer.pos(), Some(ChunkPos::new(2, 2)));
    }

    #[test]
    fn test_free_list_is_bounded() {
        let pool = pool(2);
        let readers: Vec<_> = (0..5).map(|_| pool.reader()).collect();
        drop(readers);
        assert_eq!(pool.idle_readers(), 2);
    }

    #[test]
    fn test_writer_output_reads_back_through_reader() {
        let pool = pool(2);
        let payload = b"round trip through the pool".repeat(64);

        let mut writer = pool.writer(ChunkPos::new(9, 9)).expect("writer");
        writer.write_all(&payload).expect("write");
        let record = writer
            .commit(|_, record| Ok(record.to_vec()))
            .expect("commit");
        drop(writer);

        let mut reader = pool.reader();
        reader.buffer_mut(record.len()).copy_from_slice(&record);
        reader.bake(ChunkPos::new(9, 9)).expect("bake");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");
        assert_eq!(out, payload);
    }

    #[test]
    fn test_returned_stream_is_recycled() {
        let pool = pool(1);
        let payload = b"recycled".repeat(8);
        let record = {
            let mut writer = pool.writer(ChunkPos::new(3, 3)).expect("writer");
            writer.write_all(&payload).expect("write");
            writer.commit(|_, record| Ok(record.to_vec())).expect("commit")
        };

        {
            let mut reader = pool.reader();
            reader.buffer_mut(record.len()).copy_from_slice(&record);
            reader.bake(ChunkPos::new(3, 3)).expect("bake");
            assert_eq!(reader.pos(), Some(ChunkPos::new(3, 3)));
        }

        let reader = pool.reader();
        assert_eq!(reader.pos(), None, "owner cleared before reuse");
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.idle_readers(), 0);
    }
}
