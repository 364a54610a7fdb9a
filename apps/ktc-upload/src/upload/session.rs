//! Upload Sessions
//!
//! Client-side record of one logical transfer, plus a registry that:
//! - Keeps resumable session snapshots
//! - Finds a prior session for the same file
//! - Guarantees one orchestrator per upload ID

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::slicer::{ChunkRange, ChunkSlicer};
use crate::error::UploadError;

// ============================================================================
// Upload Session
// ============================================================================

/// State of one transfer. Identity fields are fixed at construction and the
/// uploaded set only grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "SessionSnapshot")]
pub struct UploadSession {
    upload_id: String,
    filename: String,
    total_size: u64,
    chunk_size: usize,
    total_chunks: usize,
    file_hash: String,
    uploaded_chunks: BTreeSet<usize>,
    created_at: DateTime<Utc>,
}

/// Serialized form of a session, checked before it becomes an [`UploadSession`]
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionSnapshot {
    upload_id: String,
    filename: String,
    total_size: u64,
    chunk_size: usize,
    total_chunks: Option<usize>,
    file_hash: String,
    #[serde(default)]
    uploaded_chunks: BTreeSet<usize>,
    created_at: Option<DateTime<Utc>>,
}

impl TryFrom<SessionSnapshot> for UploadSession {
    type Error = UploadError;

    fn try_from(snapshot: SessionSnapshot) -> Result<Self, Self::Error> {
        let mut session = UploadSession::new(
            snapshot.upload_id,
            snapshot.filename,
            snapshot.total_size,
            snapshot.chunk_size,
            snapshot.file_hash,
        )
        .map_err(|e| UploadError::Validation(format!("invalid session snapshot: {}", e)))?;

        if let Some(total_chunks) = snapshot.total_chunks {
            if total_chunks != session.total_chunks {
                return Err(UploadError::Validation(format!(
                    "invalid session snapshot: {} chunks recorded, {} expected",
                    total_chunks, session.total_chunks
                )));
            }
        }
        for index in snapshot.uploaded_chunks {
            session
                .mark_uploaded(index)
                .map_err(|e| UploadError::Validation(format!("invalid session snapshot: {}", e)))?;
        }
        if let Some(created_at) = snapshot.created_at {
            session.created_at = created_at;
        }
        Ok(session)
    }
}

impl UploadSession {
    pub fn new(
        upload_id: impl Into<String>,
        filename: impl Into<String>,
        total_size: u64,
        chunk_size: usize,
        file_hash: impl Into<String>,
    ) -> Result<Self, UploadError> {
        let upload_id = upload_id.into();
        if upload_id.trim().is_empty() {
            return Err(UploadError::ProtocolViolation(
                "backend returned an empty upload ID".to_string(),
            ));
        }
        if total_size == 0 {
            return Err(UploadError::Validation("file is empty".to_string()));
        }
        let slicer = ChunkSlicer::new(total_size, chunk_size)?;

        Ok(Self {
            upload_id,
            filename: filename.into(),
            total_size,
            chunk_size,
            total_chunks: slicer.total_chunks(),
            file_hash: file_hash.into(),
            uploaded_chunks: BTreeSet::new(),
            created_at: Utc::now(),
        })
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn uploaded_chunks(&self) -> &BTreeSet<usize> {
        &self.uploaded_chunks
    }

    pub fn slicer(&self) -> ChunkSlicer {
        ChunkSlicer::clamped(self.total_size, self.chunk_size)
    }

    pub fn range(&self, index: usize) -> Option<ChunkRange> {
        self.slicer().range(index)
    }

    /// Check if all chunks have been confirmed
    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() == self.total_chunks
    }

    /// Indices still to upload, ascending
    pub fn missing_chunks(&self) -> Vec<usize> {
        (0..self.total_chunks)
            .filter(|i| !self.uploaded_chunks.contains(i))
            .collect()
    }

    /// Record a chunk the backend confirmed as durable
    pub fn mark_uploaded(&mut self, index: usize) -> Result<(), UploadError> {
        if index >= self.total_chunks {
            return Err(UploadError::ProtocolViolation(format!(
                "chunk index {} out of range (total chunks: {})",
                index, self.total_chunks
            )));
        }
        self.uploaded_chunks.insert(index);
        Ok(())
    }

    /// Merge the indices reported by a status query. Nothing is recorded when
    /// any index is out of range.
    pub fn apply_status(&mut self, indices: &[usize]) -> Result<(), UploadError> {
        if let Some(bad) = indices.iter().find(|&&i| i >= self.total_chunks) {
            return Err(UploadError::ProtocolViolation(format!(
                "status reported chunk {} but upload {} only has {} chunks",
                bad, self.upload_id, self.total_chunks
            )));
        }
        self.uploaded_chunks.extend(indices.iter().copied());
        Ok(())
    }

    /// Bytes covered by confirmed chunks
    pub fn uploaded_bytes(&self) -> u64 {
        let slicer = self.slicer();
        self.uploaded_chunks
            .iter()
            .filter_map(|&i| slicer.range(i))
            .map(|r| r.len())
            .sum()
    }

    /// Whether this session describes the same file
    pub fn matches(&self, filename: &str, total_size: u64, file_hash: &str) -> bool {
        self.filename == filename
            && self.total_size == total_size
            && self.file_hash.eq_ignore_ascii_case(file_hash)
    }
}

// ============================================================================
// Session Registry
// ============================================================================

/// Process-wide store of upload sessions keyed by upload ID
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    /// Latest snapshot of every known session
    sessions: HashMap<String, UploadSession>,

    /// Upload IDs currently driven by an orchestrator
    active: HashSet<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive ownership of `upload_id` until the claim is dropped
    pub fn claim(&self, upload_id: &str) -> Result<SessionClaim, UploadError> {
        let mut state = self.inner.lock();
        if !state.active.insert(upload_id.to_string()) {
            return Err(UploadError::SessionBusy(upload_id.to_string()));
        }

        tracing::debug!(upload_id = %upload_id, "Claimed upload session");

        Ok(SessionClaim {
            registry: self.clone(),
            upload_id: upload_id.to_string(),
        })
    }

    pub fn is_active(&self, upload_id: &str) -> bool {
        self.inner.lock().active.contains(upload_id)
    }

    /// Store or replace a session snapshot
    pub fn save(&self, session: &UploadSession) {
        self.inner
            .lock()
            .sessions
            .insert(session.upload_id.clone(), session.clone());
    }

    pub fn get(&self, upload_id: &str) -> Option<UploadSession> {
        self.inner.lock().sessions.get(upload_id).cloned()
    }

    /// Find an unfinished session for the same file, newest first
    pub fn find_resumable(
        &self,
        filename: &str,
        total_size: u64,
        file_hash: &str,
    ) -> Option<UploadSession> {
        let state = self.inner.lock();
        state
            .sessions
            .values()
            .filter(|s| s.matches(filename, total_size, file_hash))
            .filter(|s| !state.active.contains(&s.upload_id))
            .max_by_key(|s| s.created_at)
            .cloned()
    }

    /// Drop a session snapshot
    pub fn forget(&self, upload_id: &str) -> Option<UploadSession> {
        self.inner.lock().sessions.remove(upload_id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Remove idle snapshots created before `max_age` ago. Returns the number
    /// removed.
    pub fn prune_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut state = self.inner.lock();
        let RegistryState { sessions, active } = &mut *state;

        let before = sessions.len();
        sessions.retain(|id, s| s.created_at >= cutoff || active.contains(id));
        let count = before - sessions.len();

        if count > 0 {
            tracing::info!(count = count, "Pruned stale upload sessions");
        }
        count
    }

    fn release(&self, upload_id: &str) {
        self.inner.lock().active.remove(upload_id);
        tracing::debug!(upload_id = %upload_id, "Released upload session");
    }
}

/// Exclusive hold on an upload ID, released on drop
pub struct SessionClaim {
    registry: SessionRegistry,
    upload_id: String,
}

impl SessionClaim {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.registry.release(&self.upload_id);
    }
}

// ============================================================================
// Tests
// ============================================================================
