/// Chunk schedule for a single bulk pull.
///
/// A transfer of `total_size` bytes is cut into `ceil(total_size / chunk_size)`
/// contiguous chunks. Every chunk is `chunk_size` bytes except the last, which
/// carries the remainder.

use crate::error::EngineError;

/// One contiguous byte range of the transfer, pulled as a single unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkDescriptor {
    pub offset: u64,
    pub length: u64,
}

impl ChunkDescriptor {
    /// Exclusive end of the range.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Pure chunk arithmetic for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
    chunk_count: u64,
}

impl ChunkPlan {
    /// Build a plan. A zero chunk size has no valid schedule.
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self, EngineError> {
        if chunk_size == 0 {
            return Err(EngineError::InvalidChunkSize);
        }
        Ok(Self {
            total_size,
            chunk_size,
            chunk_count: chunk_count(total_size, chunk_size),
        })
    }

    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    #[inline]
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunk_count == 0
    }

    /// Length of chunk `index`, or `None` past the end of the schedule.
    pub fn chunk_length(&self, index: u64) -> Option<u64> {
        if index >= self.chunk_count {
            return None;
        }
        Some(self.length_at(index * self.chunk_size))
    }

    /// Length of the chunk starting at `offset`. Zero at or past the end.
    #[inline]
    pub fn length_at(&self, offset: u64) -> u64 {
        self.total_size.saturating_sub(offset).min(self.chunk_size)
    }

    /// Descriptor for the chunk starting at `offset`, if any bytes remain there.
    pub fn descriptor_at(&self, offset: u64) -> Option<ChunkDescriptor> {
        let length = self.length_at(offset);
        (length > 0).then_some(ChunkDescriptor { offset, length })
    }

    /// Window depth for this plan given a concurrency ceiling.
    #[inline]
    pub fn window_depth(&self, max_concurrency: usize) -> usize {
        self.chunk_count.min(max_concurrency as u64) as usize
    }

    /// Every chunk in offset order.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkDescriptor> + '_ {
        (0..self.chunk_count).map(move |index| {
            let offset = index * self.chunk_size;
            ChunkDescriptor {
                offset,
                length: self.length_at(offset),
            }
        })
    }
}

/// `ceil(total_size / chunk_size)`; zero bytes means zero chunks.
#[inline]
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}
