//! Command-buffer chunk pool.
//!
//! A fixed number of equally sized slices of one DRAM resource. Command
//! buffers are copied into chunks so submission never allocates device
//! memory; buffers longer than one chunk are chained with `LinkChunk`.

use crate::dma::DmaHandle;
use crate::error::{PvaError, Result};
use pva_chip::cmd::{CHUNK_TRAILER_BYTES, WORD_BYTES};
use std::sync::{Mutex, PoisonError};

/// One chunk on loan from a [`ChunkPool`]. Return it with [`ChunkPool::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk {
    index: usize,
    offset: usize,
    size: usize,
}

impl Chunk {
    /// Byte offset of the chunk inside the pool resource.
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Chunk size in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Slot index inside the pool.
    pub const fn index(&self) -> usize {
        self.index
    }
}

/// Fixed-slot chunk allocator.
#[derive(Debug)]
pub struct ChunkPool {
    region: DmaHandle,
    resource_id: u32,
    pool_offset: usize,
    chunk_size: usize,
    chunk_count: usize,
    free: Mutex<Vec<usize>>,
}

impl ChunkPool {
    /// Carve `chunk_count` chunks of `chunk_size` bytes out of
    /// `[pool_offset, pool_offset + pool_size)` of `region`, which firmware
    /// knows as `resource_id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the chunks do not fit the pool, the pool
    /// does not fit the region, or a chunk cannot hold at least one command
    /// plus its trailing link/fence command.
    pub fn new(
        region: DmaHandle,
        resource_id: u32,
        pool_offset: usize,
        pool_size: usize,
        chunk_size: usize,
        chunk_count: usize,
    ) -> Result<Self> {
        if chunk_count == 0 {
            return Err(PvaError::invalid_argument("chunk pool with zero chunks"));
        }
        if chunk_size < 2 * CHUNK_TRAILER_BYTES || chunk_size % WORD_BYTES != 0 {
            return Err(PvaError::invalid_argument(format!(
                "chunk size {chunk_size} must be a multiple of {WORD_BYTES} and at least {}",
                2 * CHUNK_TRAILER_BYTES
            )));
        }
        let needed = chunk_size
            .checked_mul(chunk_count)
            .ok_or_else(|| PvaError::invalid_argument("chunk pool size overflows"))?;
        if needed > pool_size {
            return Err(PvaError::invalid_argument(format!(
                "{chunk_count} chunks of {chunk_size} bytes exceed pool of {pool_size}"
            )));
        }
        if pool_offset % WORD_BYTES != 0
            || pool_offset
                .checked_add(pool_size)
                .map_or(true, |end| end > region.len())
        {
            return Err(PvaError::invalid_argument(format!(
                "pool [{pool_offset:#x}, +{pool_size:#x}) outside region of {:#x}",
                region.len()
            )));
        }

        tracing::debug!(
            "Chunk pool: {chunk_count} x {chunk_size} bytes in resource {resource_id}"
        );
        Ok(Self {
            region,
            resource_id,
            pool_offset,
            chunk_size,
            chunk_count,
            // Popped from the back, so chunk 0 is handed out first.
            free: Mutex::new((0..chunk_count).rev().collect()),
        })
    }

    /// Take a chunk.
    ///
    /// # Errors
    ///
    /// Returns `OutOfResources` when every chunk is on loan.
    pub fn acquire(&self) -> Result<Chunk> {
        let index = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or_else(|| PvaError::out_of_resources("command chunk pool"))?;
        Ok(Chunk {
            index,
            offset: self.pool_offset + index * self.chunk_size,
            size: self.chunk_size,
        })
    }

    /// Return a chunk.
    pub fn release(&self, chunk: Chunk) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(!free.contains(&chunk.index), "chunk {} released twice", chunk.index);
        debug_assert!(free.len() < self.chunk_count);
        free.push(chunk.index);
    }

    /// Copy `data` into `chunk` at `at`.
    ///
    /// # Panics
    ///
    /// Panics if the write would run past the end of the chunk.
    pub fn write(&self, chunk: &Chunk, at: usize, data: &[u8]) {
        assert!(
            at + data.len() <= chunk.size,
            "chunk write out of bounds: {at}+{} > {}",
            data.len(),
            chunk.size
        );
        self.region.write_bytes(chunk.offset + at, data);
    }

    /// Chunks currently on loan.
    pub fn outstanding(&self) -> usize {
        self.chunk_count - self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Total number of chunks.
    pub const fn capacity(&self) -> usize {
        self.chunk_count
    }

    /// Bytes per chunk.
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Resource id of the backing region.
    pub const fn resource_id(&self) -> u32 {
        self.resource_id
    }
}
