//! Integrity Hasher
//!
//! SHA-256 digests, hex encoded in lowercase. Changing the algorithm or the
//! encoding breaks resumption of in-flight sessions.

use sha2::{Digest, Sha256};

use super::slicer::ChunkSlicer;
use super::source::UploadSource;
use crate::error::UploadError;

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify hash matches data (hex case is ignored)
pub fn verify_hash(data: &[u8], expected_hash: &str) -> bool {
    compute_hash(data).eq_ignore_ascii_case(expected_hash.trim())
}

/// Incremental whole-file digest
#[derive(Clone, Default)]
pub struct FileHasher {
    inner: Sha256,
    bytes: u64,
}

impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes fed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Digest of a whole source, read one chunk at a time
pub async fn hash_source<S>(source: &S, chunk_size: usize) -> Result<String, UploadError>
where
    S: UploadSource + ?Sized,
{
    let size = source.size().await?;
    let slicer = ChunkSlicer::new(size, chunk_size)?;

    let mut hasher = FileHasher::new();
    for range in slicer.ranges() {
        let data = source.read_range(range).await?;
        hasher.update(&data);
    }

    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::source::MemorySource;

    #[test]
    fn test_compute_hash() {
        let hash = compute_hash(b"hello");
        assert_eq!(hash.len(), 64); // SHA-256 = 32 bytes = 64 hex chars
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_verify_hash_ignores_case() {
        let upper = compute_hash(b"room image").to_uppercase();
        assert!(verify_hash(b"room image", &upper));
        assert!(!verify_hash(b"room image!", &upper));
    }

    #[test]
    fn test_file_hasher_matches_one_shot() {
        let mut hasher = FileHasher::new();
        hasher.update(b"Hello, ");
        hasher.update(b"World!");
        assert_eq!(hasher.bytes(), 13);
        assert_eq!(hasher.finalize(), compute_hash(b"Hello, World!"));
    }

    #[tokio::test]
    async fn test_hash_source_is_chunk_size_independent() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let source = MemorySource::new("listing.jpg", data.clone());

        let small = hash_source(&source, 7).await.unwrap();
        let large = hash_source(&source, 4096).await.unwrap();
        assert_eq!(small, large);
        assert_eq!(small, compute_hash(&data));
    }
}
