//! Chunk Slicer
//!
//! Deterministic fixed-size split of `[0, total_size)` into byte ranges. The
//! same index always addresses the same bytes, which is what makes a transfer
//! resumable.

use crate::error::UploadError;

/// Half-open byte range `[start, end)` of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Number of chunks needed for `total_size` bytes, `ceil(total / chunk)`
pub fn chunk_count(total_size: u64, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size as u64) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSlicer {
    total_size: u64,
    chunk_size: u64,
}

impl ChunkSlicer {
    pub fn new(total_size: u64, chunk_size: usize) -> Result<Self, UploadError> {
        if chunk_size == 0 {
            return Err(UploadError::Validation(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            total_size,
            chunk_size: chunk_size as u64,
        })
    }

    /// Like [`ChunkSlicer::new`] but a zero chunk size becomes one byte
    pub(crate) fn clamped(total_size: u64, chunk_size: usize) -> Self {
        Self {
            total_size,
            chunk_size: chunk_size.max(1) as u64,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size as usize
    }

    pub fn total_chunks(&self) -> usize {
        chunk_count(self.total_size, self.chunk_size as usize)
    }

    /// Range of chunk `index`, `None` past the end of the file
    pub fn range(&self, index: usize) -> Option<ChunkRange> {
        if index >= self.total_chunks() {
            return None;
        }
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_size);
        Some(ChunkRange { index, start, end })
    }

    /// Lazy iterator over every chunk range in ascending order
    pub fn ranges(&self) -> ChunkRanges {
        ChunkRanges {
            slicer: *self,
            next: 0,
            total: self.total_chunks(),
        }
    }
}

/// Iterator returned by [`ChunkSlicer::ranges`]
#[derive(Debug, Clone)]
pub struct ChunkRanges {
    slicer: ChunkSlicer,
    next: usize,
    total: usize,
}

impl Iterator for ChunkRanges {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        if self.next >= self.total {
            return None;
        }
        let range = self.slicer.range(self.next);
        self.next += 1;
        range
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkRanges {}
