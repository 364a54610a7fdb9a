//! Chunk Store
//!
//! Local filesystem storage for uploaded chunks and assembled files.
//!
//! Layout under the base path:
//! - `chunks/{uploadId}/upload.json` - upload metadata
//! - `chunks/{uploadId}/{index:06}.part` - one file per stored chunk
//! - `files/{uploadId}/{filename}` - assembled, verified file

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::{AssembledFile, ChunkListing, StoredChunk, UploadRecord};
use crate::error::StorageError;
use crate::upload::hasher::{compute_hash, FileHasher};
use crate::upload::slicer::chunk_count;

const RECORD_FILE: &str = "upload.json";
const PART_SUFFIX: &str = ".part";

// ============================================================================
// Chunk Store
// ============================================================================

#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    base_path: PathBuf,

    /// Chunk size handed to clients at init
    chunk_size: usize,

    /// Upload records loaded so far (upload ID -> record)
    records: RwLock<HashMap<String, UploadRecord>>,
}

impl ChunkStore {
    /// Open (and create if needed) a store rooted at `base_path`
    pub async fn open(base_path: impl Into<PathBuf>, chunk_size: usize) -> Result<Self, StorageError> {
        if chunk_size == 0 {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk size must be greater than zero",
            )));
        }

        let base_path = base_path.into();
        tokio::fs::create_dir_all(base_path.join("chunks")).await?;
        tokio::fs::create_dir_all(base_path.join("files")).await?;

        Ok(Self {
            inner: Arc::new(ChunkStoreInner {
                base_path,
                chunk_size,
                records: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    fn chunk_dir(&self, upload_id: &str) -> PathBuf {
        self.inner.base_path.join("chunks").join(upload_id)
    }

    fn chunk_path(&self, upload_id: &str, chunk_index: usize) -> PathBuf {
        self.chunk_dir(upload_id)
            .join(format!("{:06}{}", chunk_index, PART_SUFFIX))
    }

    fn file_dir(&self, upload_id: &str) -> PathBuf {
        self.inner.base_path.join("files").join(upload_id)
    }

    // ========================================================================
    // Upload Records
    // ========================================================================

    /// Register a new upload and assign its ID
    pub async fn create_upload(
        &self,
        filename: &str,
        total_size: u64,
        file_hash: Option<String>,
    ) -> Result<UploadRecord, StorageError> {
        let filename = sanitize_filename(filename)?;

        let record = UploadRecord {
            upload_id: Uuid::new_v4().to_string(),
            filename,
            total_size,
            chunk_size: self.inner.chunk_size,
            total_chunks: chunk_count(total_size, self.inner.chunk_size),
            file_hash,
            created_at: Utc::now(),
            completed_at: None,
        };

        tokio::fs::create_dir_all(self.chunk_dir(&record.upload_id)).await?;
        self.write_record(&record).await?;

        tracing::info!(
            upload_id = %record.upload_id,
            filename = %record.filename,
            total_size = record.total_size,
            total_chunks = record.total_chunks,
            "Created upload"
        );

        Ok(record)
    }

    /// Look up an upload, falling back to its record on disk
    pub async fn get_upload(&self, upload_id: &str) -> Result<UploadRecord, StorageError> {
        validate_upload_id(upload_id)?;

        if let Some(record) = self.inner.records.read().await.get(upload_id) {
            return Ok(record.clone());
        }

        let path = self.chunk_dir(upload_id).join(RECORD_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::UploadNotFound(upload_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let record: UploadRecord = serde_json::from_slice(&bytes).map_err(io::Error::from)?;

        self.inner
            .records
            .write()
            .await
            .insert(upload_id.to_string(), record.clone());

        Ok(record)
    }

    async fn write_record(&self, record: &UploadRecord) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(record).map_err(io::Error::from)?;
        let dir = self.chunk_dir(&record.upload_id);
        write_atomic(&dir, &dir.join(RECORD_FILE), &json).await?;

        self.inner
            .records
            .write()
            .await
            .insert(record.upload_id.clone(), record.clone());
        Ok(())
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// Store one chunk. An index that is already present is left untouched
    /// and reported as skipped.
    pub async fn store_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
        data: &[u8],
        expected_hash: Option<&str>,
    ) -> Result<StoredChunk, StorageError> {
        let record = self.get_upload(upload_id).await?;
        if chunk_index >= record.total_chunks {
            return Err(StorageError::ChunkIndexOutOfBounds {
                index: chunk_index,
                total: record.total_chunks,
            });
        }
        let expected_size = record.chunk_len(chunk_index);
        if data.len() as u64 != expected_size {
            return Err(StorageError::ChunkSizeMismatch {
                index: chunk_index,
                expected: expected_size,
                actual: data.len() as u64,
            });
        }

        let path = self.chunk_path(upload_id, chunk_index);
        if let Ok(metadata) = tokio::fs::metadata(&path).await {
            tracing::debug!(
                upload_id = %upload_id,
                chunk_index = chunk_index,
                "Chunk already stored, skipping"
            );
            return Ok(StoredChunk {
                index: chunk_index,
                size: metadata.len(),
                skipped: true,
            });
        }

        if let Some(expected) = expected_hash.map(str::trim).filter(|h| !h.is_empty()) {
            let actual = compute_hash(data);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(StorageError::ChunkHashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let dir = self.chunk_dir(upload_id);
        tokio::fs::create_dir_all(&dir).await?;
        write_atomic(&dir, &path, data).await?;

        tracing::debug!(
            upload_id = %upload_id,
            chunk_index = chunk_index,
            size = data.len(),
            "Stored chunk"
        );

        Ok(StoredChunk {
            index: chunk_index,
            size: data.len() as u64,
            skipped: false,
        })
    }

    /// Chunk indices stored for `upload_id`, ascending. Empty when nothing
    /// was ever stored.
    pub async fn list_chunks(&self, upload_id: &str) -> Result<ChunkListing, StorageError> {
        validate_upload_id(upload_id)?;

        let mut listing = ChunkListing::default();
        let mut entries = match tokio::fs::read_dir(self.chunk_dir(upload_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(listing),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Some(index) = part_index(&entry.file_name()) else {
                continue;
            };
            listing.chunks.push(index);
            listing.uploaded_size += entry.metadata().await?.len();
        }
        listing.chunks.sort_unstable();

        Ok(listing)
    }

    /// Delete every chunk of an upload. Returns the number of chunk files
    /// removed, `None` if the upload had no chunk directory.
    pub async fn delete_chunks(&self, upload_id: &str) -> Result<Option<usize>, StorageError> {
        validate_upload_id(upload_id)?;

        let dir = self.chunk_dir(upload_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if part_index(&entry.file_name()).is_some() {
                count += 1;
            }
        }

        tokio::fs::remove_dir_all(&dir).await?;
        self.inner.records.write().await.remove(upload_id);

        tracing::info!(upload_id = %upload_id, deleted = count, "Deleted upload chunks");

        Ok(Some(count))
    }

    // ========================================================================
    // Assembly
    // ========================================================================

    /// Concatenate all chunks in index order and verify the result against
    /// `expected_hash`. On mismatch the assembled file is removed and the
    /// chunks are kept.
    pub async fn assemble(
        &self,
        upload_id: &str,
        filename: &str,
        expected_hash: &str,
    ) -> Result<AssembledFile, StorageError> {
        let mut record = self.get_upload(upload_id).await?;
        let filename = sanitize_filename(filename)?;

        let listing = self.list_chunks(upload_id).await?;
        let missing: Vec<usize> = (0..record.total_chunks)
            .filter(|i| listing.chunks.binary_search(i).is_err())
            .collect();
        if !missing.is_empty() {
            return Err(StorageError::MissingChunks(missing));
        }

        let file_dir = self.file_dir(upload_id);
        tokio::fs::create_dir_all(&file_dir).await?;
        let tmp = file_dir.join(format!(".{}.tmp", Uuid::new_v4()));

        let hasher = match self.concatenate(upload_id, record.total_chunks, &tmp).await {
            Ok(hasher) => hasher,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        let size = hasher.bytes();
        let actual = hasher.finalize();

        if !actual.eq_ignore_ascii_case(expected_hash.trim()) {
            let _ = tokio::fs::remove_file(&tmp).await;
            tracing::warn!(
                upload_id = %upload_id,
                expected = %expected_hash,
                actual = %actual,
                "Assembled file failed hash verification"
            );
            return Err(StorageError::FileHashMismatch {
                expected: expected_hash.to_string(),
                actual,
            });
        }

        let path = file_dir.join(&filename);
        tokio::fs::rename(&tmp, &path).await?;

        record.completed_at = Some(Utc::now());
        self.write_record(&record).await?;

        tracing::info!(
            upload_id = %upload_id,
            filename = %filename,
            size = size,
            "Assembled upload"
        );

        Ok(AssembledFile {
            path,
            size,
            file_hash: actual,
        })
    }

    async fn concatenate(
        &self,
        upload_id: &str,
        total_chunks: usize,
        target: &Path,
    ) -> Result<FileHasher, StorageError> {
        let mut out = tokio::fs::File::create(target).await?;
        let mut hasher = FileHasher::new();

        for index in 0..total_chunks {
            let data = tokio::fs::read(self.chunk_path(upload_id, index)).await?;
            hasher.update(&data);
            out.write_all(&data).await?;
        }
        out.flush().await?;

        Ok(hasher)
    }

    /// Path of the assembled file of `upload_id`, if any
    pub async fn find_file(&self, upload_id: &str) -> Result<Option<PathBuf>, StorageError> {
        validate_upload_id(upload_id)?;

        let mut entries = match tokio::fs::read_dir(self.file_dir(upload_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !hidden && entry.file_type().await?.is_file() {
                return Ok(Some(entry.path()));
            }
        }

        Ok(None)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Reject names that could escape the upload directory
pub fn sanitize_filename(name: &str) -> Result<String, StorageError> {
    let trimmed = name.trim();
    let invalid = trimmed.is_empty()
        || trimmed == "."
        || trimmed.contains("..")
        || trimmed.chars().any(|c| matches!(c, '/' | '\\' | '\0'));

    if invalid {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Upload IDs are UUIDs issued by this store, anything else is unknown
fn validate_upload_id(upload_id: &str) -> Result<(), StorageError> {
    Uuid::parse_str(upload_id)
        .map(|_| ())
        .map_err(|_| StorageError::UploadNotFound(upload_id.to_string()))
}

fn part_index(name: &OsStr) -> Option<usize> {
    name.to_str()?.strip_suffix(PART_SUFFIX)?.parse().ok()
}

/// Write to a temp file in `dir`, then rename over `target`
async fn write_atomic(dir: &Path, target: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    tokio::fs::write(&tmp, data).await?;

    if let Err(e) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_store(chunk_size: usize) -> (TempDir, ChunkStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::open(temp_dir.path(), chunk_size).await.unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_store_and_list_chunks() {
        let (_dir, store) = create_test_store(4).await;
        let record = store.create_upload("room.jpg", 10, None).await.unwrap();
        assert_eq!(record.total_chunks, 3);

        let data = b"abcd";
        let stored = store
            .store_chunk(&record.upload_id, 1, data, Some(&compute_hash(data)))
            .await
            .unwrap();
        assert!(!stored.skipped);

        let listing = store.list_chunks(&record.upload_id).await.unwrap();
        assert_eq!(listing.chunks, vec![1]);
        assert_eq!(listing.uploaded_size, 4);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_is_skipped() {
        let (_dir, store) = create_test_store(4).await;
        let record = store.create_upload("room.jpg", 8, None).await.unwrap();

        store.store_chunk(&record.upload_id, 0, b"abcd", None).await.unwrap();
        let again = store
            .store_chunk(&record.upload_id, 0, b"zzzz", None)
            .await
            .unwrap();
        assert!(again.skipped);

        // First write wins
        let bytes = tokio::fs::read(store.chunk_path(&record.upload_id, 0)).await.unwrap();
        assert_eq!(bytes, b"abcd");
    }

    #[tokio::test]
    async fn test_chunk_hash_mismatch() {
        let (_dir, store) = create_test_store(4).await;
        let record = store.create_upload("room.jpg", 8, None).await.unwrap();

        let result = store
            .store_chunk(&record.upload_id, 0, b"abcd", Some("wrong_hash"))
            .await;
        assert!(matches!(result, Err(StorageError::ChunkHashMismatch { .. })));
        assert!(store.list_chunks(&record.upload_id).await.unwrap().chunks.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_index_out_of_bounds() {
        let (_dir, store) = create_test_store(4).await;
        let record = store.create_upload("room.jpg", 8, None).await.unwrap();

        let result = store.store_chunk(&record.upload_id, 2, b"ab", None).await;
        assert!(matches!(
            result,
            Err(StorageError::ChunkIndexOutOfBounds { index: 2, total: 2 })
        ));
    }

    #[tokio::test]
    async fn test_chunk_with_wrong_length_rejected() {
        let (_dir, store) = create_test_store(4).await;
        let record = store.create_upload("room.jpg", 10, None).await.unwrap();
        let id = &record.upload_id;

        assert!(matches!(
            store.store_chunk(id, 0, b"abc", None).await,
            Err(StorageError::ChunkSizeMismatch { index: 0, expected: 4, actual: 3 })
        ));
        assert!(matches!(
            store.store_chunk(id, 2, b"abcd", None).await,
            Err(StorageError::ChunkSizeMismatch { index: 2, expected: 2, actual: 4 })
        ));
        assert!(store.list_chunks(id).await.unwrap().chunks.is_empty());

        store.store_chunk(id, 2, b"ab", None).await.unwrap();
        assert_eq!(store.list_chunks(id).await.unwrap().chunks, vec![2]);
    }

    #[tokio::test]
    async fn test_assemble_verifies_hash() {
        let (_dir, store) = create_test_store(7).await;
        let record = store.create_upload("hello.txt", 13, None).await.unwrap();
        let id = &record.upload_id;

        store.store_chunk(id, 1, b"World!", None).await.unwrap();
        store.store_chunk(id, 0, b"Hello, ", None).await.unwrap();

        let file = store
            .assemble(id, "hello.txt", &compute_hash(b"Hello, World!"))
            .await
            .unwrap();
        assert_eq!(file.size, 13);
        assert_eq!(tokio::fs::read(&file.path).await.unwrap(), b"Hello, World!");
        assert_eq!(store.find_file(id).await.unwrap(), Some(file.path));
        assert!(store.get_upload(id).await.unwrap().completed_at.is_some());
    }

    #[tokio::test]
    async fn test_assemble_mismatch_keeps_chunks() {
        let (_dir, store) = create_test_store(4).await;
        let record = store.create_upload("room.jpg", 12, None).await.unwrap();
        let id = &record.upload_id;
        for (i, part) in [b"aaaa", b"bbbb", b"cccc"].iter().enumerate() {
            store.store_chunk(id, i, *part, None).await.unwrap();
        }

        let result = store.assemble(id, "room.jpg", &compute_hash(b"other")).await;
        assert!(matches!(result, Err(StorageError::FileHashMismatch { .. })));
        assert_eq!(store.find_file(id).await.unwrap(), None);

        assert_eq!(store.delete_chunks(id).await.unwrap(), Some(3));
        assert_eq!(store.delete_chunks(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_assemble_reports_missing_chunks() {
        let (_dir, store) = create_test_store(4).await;
        let record = store.create_upload("room.jpg", 12, None).await.unwrap();
        store.store_chunk(&record.upload_id, 1, b"bbbb", None).await.unwrap();

        let result = store.assemble(&record.upload_id, "room.jpg", "00").await;
        match result {
            Err(StorageError::MissingChunks(missing)) => assert_eq!(missing, vec![0, 2]),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_records_survive_restart() {
        let (dir, store) = create_test_store(4).await;
        let record = store.create_upload("room.jpg", 8, Some("ff".to_string())).await.unwrap();
        store.store_chunk(&record.upload_id, 0, b"abcd", None).await.unwrap();
        drop(store);

        let reopened = ChunkStore::open(dir.path(), 4).await.unwrap();
        let loaded = reopened.get_upload(&record.upload_id).await.unwrap();
        assert_eq!(loaded, record);
        assert_eq!(reopened.list_chunks(&record.upload_id).await.unwrap().chunks, vec![0]);
    }

    #[tokio::test]
    async fn test_unknown_upload() {
        let (_dir, store) = create_test_store(4).await;
        let unknown = Uuid::new_v4().to_string();

        assert!(store.list_chunks(&unknown).await.unwrap().chunks.is_empty());
        assert!(matches!(
            store.get_upload("../etc").await,
            Err(StorageError::UploadNotFound(_))
        ));
        assert!(matches!(
            store.store_chunk(&unknown, 0, b"x", None).await,
            Err(StorageError::UploadNotFound(_))
        ));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename(" room.jpg ").unwrap(), "room.jpg");
        for bad in ["", "  ", ".", "..", "../x", "a/b", "a\\b", "x..y"] {
            assert!(sanitize_filename(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
