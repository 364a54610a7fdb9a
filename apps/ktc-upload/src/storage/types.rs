//! Storage types

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::upload::slicer::ChunkSlicer;

/// Metadata of one upload, persisted next to its chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub upload_id: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: usize,
    /// Derived from `total_size` and the store's chunk size, not the client's
    pub total_chunks: usize,
    pub file_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadRecord {
    /// Byte length chunk `index` must have, 0 when out of range
    pub fn chunk_len(&self, index: usize) -> u64 {
        ChunkSlicer::clamped(self.total_size, self.chunk_size)
            .range(index)
            .map_or(0, |range| range.len())
    }
}

/// Result of storing one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredChunk {
    pub index: usize,
    pub size: u64,
    /// The index was already present and nothing was written
    pub skipped: bool,
}

/// Chunk indices present on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkListing {
    pub chunks: Vec<usize>,
    pub uploaded_size: u64,
}

/// Final file produced by assembly
#[derive(Debug, Clone)]
pub struct AssembledFile {
    pub path: PathBuf,
    pub size: u64,
    pub file_hash: String,
}
