//! Upload Orchestrator
//!
//! Drives one logical transfer through init (or resume), sequential chunk
//! transmission, completion and cleanup. Progress is tracked by an explicit
//! [`UploadState`] whose transitions are a pure function of the event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::hasher::{compute_hash, hash_source};
use super::retry::RetryPolicy;
use super::session::{SessionRegistry, UploadSession};
use super::slicer::chunk_count;
use super::source::UploadSource;
use super::transport::UploadTransport;
use super::types::{ChunkUpload, CompleteRequest, InitRequest, UploadOutcome};
use crate::error::{Operation, UploadError};

// ============================================================================
// State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    NotStarted,
    Initializing,
    Resuming,
    Transmitting,
    Completing,
    CleaningUp,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEvent {
    /// Fresh transfer, no prior session
    Start,
    /// Prior session found, skip init
    Resume,
    Initialized,
    StatusLoaded,
    ChunkStored,
    AllChunksStored,
    Completed,
    CleanupFinished,
    Fail,
}

impl UploadState {
    /// Next state for `event`, `None` when the event is not accepted here
    pub fn on(self, event: UploadEvent) -> Option<UploadState> {
        use UploadEvent as E;
        use UploadState as S;

        match (self, event) {
            (S::Done | S::Failed, _) => None,
            (_, E::Fail) => Some(S::Failed),
            (S::NotStarted, E::Start) => Some(S::Initializing),
            (S::NotStarted, E::Resume) => Some(S::Resuming),
            (S::Initializing, E::Initialized) => Some(S::Resuming),
            (S::Resuming, E::StatusLoaded) => Some(S::Transmitting),
            (S::Transmitting, E::ChunkStored) => Some(S::Transmitting),
            (S::Transmitting, E::AllChunksStored) => Some(S::Completing),
            (S::Completing, E::Completed) => Some(S::CleaningUp),
            (S::CleaningUp, E::CleanupFinished) => Some(S::Done),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Done | UploadState::Failed)
    }
}

// ============================================================================
// Progress & Cancellation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub chunks_uploaded: usize,
    pub total_chunks: usize,
}

impl UploadProgress {
    fn of(session: &UploadSession) -> Self {
        Self {
            uploaded_bytes: session.uploaded_bytes(),
            total_bytes: session.total_size(),
            chunks_uploaded: session.uploaded_chunks().len(),
            total_chunks: session.total_chunks(),
        }
    }

    /// Rounded percentage, 0-100
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let ratio = self.uploaded_bytes as f64 / self.total_bytes as f64;
        (ratio * 100.0).round().min(100.0) as u8
    }
}

pub type ProgressCallback = Box<dyn Fn(&UploadProgress) + Send + Sync>;

/// Cooperative stop signal, checked before every chunk
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct UploadOrchestrator<T> {
    transport: T,
    /// Provisional chunk size, replaced by the backend's at init
    chunk_size: usize,
    retry: RetryPolicy,
    registry: Option<SessionRegistry>,
    session: Option<UploadSession>,
    state: UploadState,
    progress: Option<ProgressCallback>,
    abort: AbortHandle,
}

impl<T: UploadTransport> UploadOrchestrator<T> {
    pub fn new(transport: T, chunk_size: usize) -> Self {
        Self {
            transport,
            chunk_size,
            retry: RetryPolicy::default(),
            registry: None,
            session: None,
            state: UploadState::NotStarted,
            progress: None,
            abort: AbortHandle::new(),
        }
    }

    /// Policy used to retry `complete`
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Snapshot sessions into `registry` and resume from it automatically
    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Resume an existing session instead of calling init
    pub fn with_session(mut self, session: UploadSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&UploadProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Current session, kept after a failure so it can be persisted and resumed
    pub fn session(&self) -> Option<&UploadSession> {
        self.session.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Transfer `source` and attach it to `owner_reference`.
    ///
    /// After a failure the same orchestrator may be run again; it resumes the
    /// session it kept instead of starting over.
    pub async fn upload<S>(
        &mut self,
        source: &S,
        owner_reference: &str,
    ) -> Result<UploadOutcome, UploadError>
    where
        S: UploadSource + ?Sized,
    {
        match self.state {
            UploadState::NotStarted => {}
            UploadState::Failed => self.state = UploadState::NotStarted,
            other => {
                return Err(UploadError::Internal(format!(
                    "cannot start an upload in state {:?}",
                    other
                )))
            }
        }

        let result = self.drive(source, owner_reference).await;
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    /// Give up on the kept session and ask the backend to drop its chunks
    pub async fn abandon(&mut self) -> Result<Option<usize>, UploadError> {
        let Some(session) = self.session.take() else {
            return Ok(None);
        };
        if let Some(registry) = &self.registry {
            registry.forget(session.upload_id());
        }

        let reply = self.transport.cleanup(session.upload_id()).await?;
        tracing::info!(
            upload_id = %session.upload_id(),
            deleted_files = ?reply.deleted_files,
            "Upload abandoned"
        );
        Ok(reply.deleted_files)
    }

    // ========================================================================
    // Phases
    // ========================================================================

    async fn drive<S>(&mut self, source: &S, owner_reference: &str) -> Result<UploadOutcome, UploadError>
    where
        S: UploadSource + ?Sized,
    {
        let filename = source.filename().to_string();
        if filename.trim().is_empty() {
            return Err(UploadError::Validation("filename is empty".to_string()));
        }
        let total_size = source.size().await?;
        if total_size == 0 {
            return Err(UploadError::Validation(format!("{} is empty", filename)));
        }
        if self.chunk_size == 0 {
            return Err(UploadError::Validation(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        let file_hash = hash_source(source, self.chunk_size).await?;

        let mut session = match self.resumable_session(&filename, total_size, &file_hash)? {
            Some(session) => {
                self.advance(UploadEvent::Resume)?;
                tracing::info!(
                    upload_id = %session.upload_id(),
                    filename = %filename,
                    uploaded = session.uploaded_chunks().len(),
                    total_chunks = session.total_chunks(),
                    "Resuming upload"
                );
                session
            }
            None => {
                self.advance(UploadEvent::Start)?;
                let session = self.initialize(&filename, total_size, &file_hash).await?;
                self.advance(UploadEvent::Initialized)?;
                session
            }
        };

        let result = self.transfer(&mut session, source, owner_reference).await;
        self.session = Some(session);
        result
    }

    fn resumable_session(
        &mut self,
        filename: &str,
        total_size: u64,
        file_hash: &str,
    ) -> Result<Option<UploadSession>, UploadError> {
        if let Some(session) = self.session.take() {
            if !session.matches(filename, total_size, file_hash) {
                // Dropped, a rerun starts with init
                if let Some(registry) = &self.registry {
                    registry.forget(session.upload_id());
                }
                return Err(UploadError::Validation(format!(
                    "session {} is for {} ({} bytes, hash {}), not {} ({} bytes, hash {})",
                    session.upload_id(),
                    session.filename(),
                    session.total_size(),
                    session.file_hash(),
                    filename,
                    total_size,
                    file_hash
                )));
            }
            return Ok(Some(session));
        }

        Ok(self
            .registry
            .as_ref()
            .and_then(|r| r.find_resumable(filename, total_size, file_hash)))
    }

    async fn initialize(
        &self,
        filename: &str,
        total_size: u64,
        file_hash: &str,
    ) -> Result<UploadSession, UploadError> {
        let request = InitRequest {
            filename: filename.to_string(),
            total_chunks: chunk_count(total_size, self.chunk_size),
            total_size,
            file_hash: Some(file_hash.to_string()),
        };
        let reply = self.transport.init(&request).await?;

        let chunk_size = match reply.chunk_size {
            Some(0) => {
                return Err(UploadError::Validation(
                    "backend requested a chunk size of zero".to_string(),
                ))
            }
            Some(size) => size,
            None => self.chunk_size,
        };
        if chunk_size != self.chunk_size {
            tracing::debug!(
                provisional = self.chunk_size,
                negotiated = chunk_size,
                "Backend overrode chunk size"
            );
        }

        UploadSession::new(reply.upload_id, filename, total_size, chunk_size, file_hash)
    }

    async fn transfer<S>(
        &mut self,
        session: &mut UploadSession,
        source: &S,
        owner_reference: &str,
    ) -> Result<UploadOutcome, UploadError>
    where
        S: UploadSource + ?Sized,
    {
        let _claim = self
            .registry
            .as_ref()
            .map(|r| r.claim(session.upload_id()))
            .transpose()?;

        // Resuming: the backend's view is authoritative
        let stored = self.transport.status(session.upload_id()).await?;
        session.apply_status(&stored)?;
        self.checkpoint(session);
        self.advance(UploadEvent::StatusLoaded)?;

        tracing::debug!(
            upload_id = %session.upload_id(),
            stored = session.uploaded_chunks().len(),
            total_chunks = session.total_chunks(),
            "Upload status loaded"
        );

        // Transmitting
        for index in session.missing_chunks() {
            if self.abort.is_aborted() {
                return Err(UploadError::Cancelled);
            }
            self.send_chunk(session, source, index).await?;
            session.mark_uploaded(index)?;
            self.checkpoint(session);
            self.advance(UploadEvent::ChunkStored)?;
        }

        if !session.is_complete() {
            return Err(UploadError::Internal(format!(
                "chunks {:?} still missing after transmission",
                session.missing_chunks()
            )));
        }
        if self.abort.is_aborted() {
            return Err(UploadError::Cancelled);
        }
        self.advance(UploadEvent::AllChunksStored)?;

        // Completing
        let request = CompleteRequest {
            upload_id: session.upload_id().to_string(),
            filename: session.filename().to_string(),
            file_hash: session.file_hash().to_string(),
            owner_reference: owner_reference.to_string(),
        };
        let transport = &self.transport;
        let request_ref = &request;
        let reply = self
            .retry
            .run(Operation::Complete, move || transport.complete(request_ref))
            .await?;
        self.advance(UploadEvent::Completed)?;

        if let Some(registry) = &self.registry {
            registry.forget(session.upload_id());
        }

        tracing::info!(
            upload_id = %session.upload_id(),
            filename = %session.filename(),
            size = session.total_size(),
            file_url = ?reply.file_url,
            "Upload completed"
        );

        // Cleaning up: best effort, never changes the outcome
        match self.transport.cleanup(session.upload_id()).await {
            Ok(cleanup) => tracing::debug!(
                upload_id = %session.upload_id(),
                deleted_files = ?cleanup.deleted_files,
                "Upload chunks cleaned up"
            ),
            Err(e) => tracing::warn!(
                upload_id = %session.upload_id(),
                error = %e,
                "Cleanup after completion failed"
            ),
        }
        self.advance(UploadEvent::CleanupFinished)?;

        Ok(UploadOutcome {
            success: true,
            upload_id: session.upload_id().to_string(),
            file_url: reply.file_url,
        })
    }

    async fn send_chunk<S>(
        &self,
        session: &UploadSession,
        source: &S,
        index: usize,
    ) -> Result<(), UploadError>
    where
        S: UploadSource + ?Sized,
    {
        let range = session.range(index).ok_or_else(|| {
            UploadError::Internal(format!("no byte range for chunk {}", index))
        })?;

        let data = source.read_range(range).await?;
        if data.len() as u64 != range.len() {
            return Err(UploadError::Validation(format!(
                "{} changed while uploading: chunk {} read {} of {} bytes",
                session.filename(),
                index,
                data.len(),
                range.len()
            )));
        }
        let chunk_hash = compute_hash(&data);

        self.transport
            .upload_chunk(&ChunkUpload {
                upload_id: session.upload_id(),
                chunk_index: index,
                total_chunks: session.total_chunks(),
                filename: session.filename(),
                data: &data,
                chunk_hash: Some(&chunk_hash),
            })
            .await?;

        Ok(())
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    fn advance(&mut self, event: UploadEvent) -> Result<(), UploadError> {
        let next = self.state.on(event).ok_or_else(|| {
            UploadError::Internal(format!("event {:?} not accepted in state {:?}", event, self.state))
        })?;
        if next != self.state {
            tracing::trace!(from = ?self.state, to = ?next, "Upload state changed");
        }
        self.state = next;
        Ok(())
    }

    fn checkpoint(&self, session: &UploadSession) {
        if let Some(registry) = &self.registry {
            registry.save(session);
        }
        if let Some(callback) = &self.progress {
            callback(&UploadProgress::of(session));
        }
    }

    fn fail(&mut self, err: &UploadError) {
        self.state = self.state.on(UploadEvent::Fail).unwrap_or(UploadState::Failed);

        let upload_id = self.session.as_ref().map(|s| s.upload_id().to_string());

        // Untrusted or unknown remote state, restart from init
        if err.invalidates_session() {
            if let Some(session) = self.session.take() {
                if let Some(registry) = &self.registry {
                    registry.forget(session.upload_id());
                }
            }
        } else if let (Some(registry), Some(session)) = (&self.registry, &self.session) {
            registry.save(session);
        }

        tracing::warn!(
            upload_id = ?upload_id,
            kind = ?err.kind(),
            error = %err,
            "Upload failed"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
