//! Upload Sources
//!
//! Byte sources the orchestrator reads chunks from. Only one chunk is held in
//! memory at a time.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::slicer::ChunkRange;
use crate::error::UploadError;

/// Something that can be uploaded in chunks
#[async_trait]
pub trait UploadSource: Send + Sync {
    /// File name reported to the backend
    fn filename(&self) -> &str;

    /// Total length in bytes
    async fn size(&self) -> Result<u64, UploadError>;

    /// Read exactly the bytes of `range`
    async fn read_range(&self, range: ChunkRange) -> Result<Vec<u8>, UploadError>;
}

/// File on the local filesystem
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    filename: String,
    size: u64,
}

impl FileSource {
    /// Open `path`, using its final component as the upload file name
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref().to_path_buf();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self::open_as(path, filename).await
    }

    /// Open `path` but report `filename` to the backend
    pub async fn open_as(
        path: impl AsRef<Path>,
        filename: impl Into<String>,
    ) -> Result<Self, UploadError> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Validation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        Ok(Self {
            path,
            filename: filename.into(),
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UploadSource for FileSource {
    fn filename(&self) -> &str {
        &self.filename
    }

    async fn size(&self) -> Result<u64, UploadError> {
        Ok(self.size)
    }

    async fn read_range(&self, range: ChunkRange) -> Result<Vec<u8>, UploadError> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(range.start)).await?;

        let mut data = vec![0u8; range.len() as usize];
        file.read_exact(&mut data).await?;
        Ok(data)
    }
}

/// In-memory buffer, mostly for tests and generated content
#[derive(Debug, Clone)]
pub struct MemorySource {
    filename: String,
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[async_trait]
impl UploadSource for MemorySource {
    fn filename(&self) -> &str {
        &self.filename
    }

    async fn size(&self) -> Result<u64, UploadError> {
        Ok(self.data.len() as u64)
    }

    async fn read_range(&self, range: ChunkRange) -> Result<Vec<u8>, UploadError> {
        self.data
            .get(range.start as usize..range.end as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                UploadError::Internal(format!(
                    "range {}..{} outside of {} bytes",
                    range.start,
                    range.end,
                    self.data.len()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::slicer::ChunkSlicer;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_source_reads_ranges() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("contract.pdf");
        let content: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        tokio::fs::write(&path, &content).await.unwrap();

        let source = FileSource::open(&path).await.unwrap();
        assert_eq!(source.filename(), "contract.pdf");
        assert_eq!(source.size().await.unwrap(), 1000);

        let slicer = ChunkSlicer::new(1000, 300).unwrap();
        let mut rebuilt = Vec::new();
        for range in slicer.ranges() {
            rebuilt.extend(source.read_range(range).await.unwrap());
        }
        assert_eq!(rebuilt, content);
    }

    #[tokio::test]
    async fn test_file_source_rejects_directory() {
        let temp_dir = TempDir::new().unwrap();
        let result = FileSource::open(temp_dir.path()).await;
        assert!(matches!(result, Err(UploadError::Validation(_))));
    }

    #[tokio::test]
    async fn test_memory_source_out_of_range() {
        let source = MemorySource::new("a.bin", vec![1, 2, 3]);
        let range = ChunkRange { index: 0, start: 2, end: 5 };
        assert!(source.read_range(range).await.is_err());
    }
}
