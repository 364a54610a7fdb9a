//! Upload Transport
//!
//! The five protocol operations behind a trait, with an HTTP implementation
//! built on reqwest. `init` and `upload_chunk` run under the injected
//! [`RetryPolicy`]; `status`, `complete` and `cleanup` make a single attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use super::retry::RetryPolicy;
use super::types::{
    ChunkUpload, ChunkUploadResponse, CleanupResponse, CompleteRequest, CompleteResponse,
    ErrorBody, InitRequest, InitResponse, StatusResponse,
};
use crate::config::ClientConfig;
use crate::error::{Operation, UploadError};

// ============================================================================
// Transport Trait
// ============================================================================

/// Request/response channel to the upload backend
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Open a new upload, returns its ID and the chunk size to use
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, UploadError>;

    /// Chunk indices already stored for `upload_id` (empty when unknown)
    async fn status(&self, upload_id: &str) -> Result<Vec<usize>, UploadError>;

    /// Submit one chunk; repeating an accepted index is a no-op success
    async fn upload_chunk(&self, chunk: &ChunkUpload<'_>) -> Result<ChunkUploadResponse, UploadError>;

    /// Ask the backend to assemble and verify the file
    async fn complete(&self, request: &CompleteRequest) -> Result<CompleteResponse, UploadError>;

    /// Drop the backend's temporary chunk data
    async fn cleanup(&self, upload_id: &str) -> Result<CleanupResponse, UploadError>;
}

#[async_trait]
impl<T: UploadTransport + ?Sized> UploadTransport for Arc<T> {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, UploadError> {
        (**self).init(request).await
    }

    async fn status(&self, upload_id: &str) -> Result<Vec<usize>, UploadError> {
        (**self).status(upload_id).await
    }

    async fn upload_chunk(&self, chunk: &ChunkUpload<'_>) -> Result<ChunkUploadResponse, UploadError> {
        (**self).upload_chunk(chunk).await
    }

    async fn complete(&self, request: &CompleteRequest) -> Result<CompleteResponse, UploadError> {
        (**self).complete(request).await
    }

    async fn cleanup(&self, upload_id: &str) -> Result<CleanupResponse, UploadError> {
        (**self).cleanup(upload_id).await
    }
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// HTTP client for the upload API
#[derive(Debug, Clone)]
pub struct TransportClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl TransportClient {
    /// Client for the API rooted at `base_url` (e.g. `http://host/api`)
    pub fn new(base_url: impl Into<String>, retry: RetryPolicy) -> Result<Self, UploadError> {
        Self::with_timeout(base_url, retry, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, UploadError> {
        Self::with_timeout(
            config.api_url.clone(),
            RetryPolicy::from(&config.retry),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn url(&self, path: &str) -> String {
        format!("{}/upload/{}", self.base_url, path)
    }

    fn url_with_id(&self, path: &str, upload_id: &str) -> String {
        format!(
            "{}?uploadId={}",
            self.url(path),
            urlencoding::encode(upload_id)
        )
    }

    // ========================================================================
    // Single Attempts
    // ========================================================================

    async fn send_init(&self, request: &InitRequest) -> Result<InitResponse, UploadError> {
        let response = self
            .http
            .post(self.url("init"))
            .json(request)
            .send()
            .await
            .map_err(|e| network_error(Operation::Init, e))?;

        let status = response.status();
        if status.is_client_error() && !is_retryable_status(status) {
            let body = error_body(response).await;
            return Err(UploadError::Validation(format!(
                "init rejected ({}): {}",
                status,
                body.describe()
            )));
        }

        let response = ensure_success(Operation::Init, response).await?;
        decode(Operation::Init, response).await
    }

    async fn send_chunk(&self, chunk: &ChunkUpload<'_>) -> Result<ChunkUploadResponse, UploadError> {
        // Forms are consumed on send, so every attempt builds its own
        let mut form = Form::new()
            .text("uploadId", chunk.upload_id.to_string())
            .text("chunkIndex", chunk.chunk_index.to_string())
            .text("totalChunks", chunk.total_chunks.to_string())
            .text("filename", chunk.filename.to_string())
            .part(
                "chunk",
                Part::bytes(chunk.data.to_vec()).file_name(chunk.filename.to_string()),
            );
        if let Some(hash) = chunk.chunk_hash {
            form = form.text("chunkHash", hash.to_string());
        }

        let response = self
            .http
            .post(self.url("chunk"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| network_error(Operation::UploadChunk, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let body = error_body(response).await;
            return Err(UploadError::SessionExpired(format!(
                "chunk {} of {} rejected: {}",
                chunk.chunk_index,
                chunk.upload_id,
                body.describe()
            )));
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(UploadError::Transient {
                operation: Operation::UploadChunk,
                status: Some(status.as_u16()),
                reason: format!("chunk {} failed: {}", chunk.chunk_index, body.describe()),
            });
        }

        let reply: ChunkUploadResponse = decode(Operation::UploadChunk, response).await?;
        if !reply.success {
            return Err(UploadError::Transient {
                operation: Operation::UploadChunk,
                status: Some(status.as_u16()),
                reason: format!(
                    "chunk {} not accepted: {}",
                    chunk.chunk_index,
                    reply.message.as_deref().unwrap_or("no reason given")
                ),
            });
        }
        if reply.chunk_index != chunk.chunk_index {
            return Err(UploadError::ProtocolViolation(format!(
                "sent chunk {} but backend acknowledged chunk {}",
                chunk.chunk_index, reply.chunk_index
            )));
        }

        Ok(reply)
    }
}

#[async_trait]
impl UploadTransport for TransportClient {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, UploadError> {
        let reply = self.retry.run(Operation::Init, move || self.send_init(request)).await?;

        tracing::info!(
            upload_id = %reply.upload_id,
            filename = %request.filename,
            total_chunks = request.total_chunks,
            chunk_size = ?reply.chunk_size,
            "Upload session initialized"
        );

        Ok(reply)
    }

    async fn status(&self, upload_id: &str) -> Result<Vec<usize>, UploadError> {
        let response = self
            .http
            .get(self.url_with_id("status", upload_id))
            .send()
            .await
            .map_err(|e| network_error(Operation::Status, e).into_fatal(1))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let response = ensure_success(Operation::Status, response)
            .await
            .map_err(|e| e.into_fatal(1))?;
        let status: StatusResponse = decode(Operation::Status, response).await?;

        Ok(status.chunks)
    }

    async fn upload_chunk(&self, chunk: &ChunkUpload<'_>) -> Result<ChunkUploadResponse, UploadError> {
        let reply = self
            .retry
            .run(Operation::UploadChunk, move || self.send_chunk(chunk))
            .await?;

        tracing::debug!(
            upload_id = %chunk.upload_id,
            chunk_index = chunk.chunk_index,
            bytes = chunk.data.len(),
            skipped = reply.skipped,
            "Chunk uploaded"
        );

        Ok(reply)
    }

    async fn complete(&self, request: &CompleteRequest) -> Result<CompleteResponse, UploadError> {
        let response = self
            .http
            .post(self.url("complete"))
            .json(request)
            .send()
            .await
            .map_err(|e| network_error(Operation::Complete, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;

            if body.is_file_hash_mismatch() {
                return Err(UploadError::Integrity {
                    expected: body.expected.unwrap_or_else(|| request.file_hash.clone()),
                    actual: body.actual,
                });
            }
            if status == StatusCode::NOT_FOUND {
                return Err(UploadError::SessionExpired(format!(
                    "complete of {} rejected: {}",
                    request.upload_id,
                    body.describe()
                )));
            }

            let reason = format!("complete rejected ({}): {}", status, body.describe());
            if is_retryable_status(status) {
                return Err(UploadError::Transient {
                    operation: Operation::Complete,
                    status: Some(status.as_u16()),
                    reason,
                });
            }
            return Err(UploadError::FatalTransport {
                operation: Operation::Complete,
                attempts: 1,
                status: Some(status.as_u16()),
                reason,
            });
        }

        let reply: CompleteResponse = decode(Operation::Complete, response).await?;
        if !reply.success {
            return Err(UploadError::FatalTransport {
                operation: Operation::Complete,
                attempts: 1,
                status: Some(status.as_u16()),
                reason: reply
                    .message
                    .unwrap_or_else(|| "backend reported failure".to_string()),
            });
        }

        Ok(reply)
    }

    async fn cleanup(&self, upload_id: &str) -> Result<CleanupResponse, UploadError> {
        let response = self
            .http
            .post(self.url_with_id("cleanup", upload_id))
            .send()
            .await
            .map_err(|e| network_error(Operation::Cleanup, e).into_fatal(1))?;

        let response = ensure_success(Operation::Cleanup, response)
            .await
            .map_err(|e| e.into_fatal(1))?;
        decode(Operation::Cleanup, response).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn network_error(operation: Operation, err: reqwest::Error) -> UploadError {
    UploadError::Transient {
        operation,
        status: err.status().map(|s| s.as_u16()),
        reason: err.to_string(),
    }
}

/// 5xx, request timeout and rate limiting are worth another attempt
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Map a non-2xx response to a transient error
async fn ensure_success(operation: Operation, response: Response) -> Result<Response, UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = error_body(response).await;
    Err(UploadError::Transient {
        operation,
        status: Some(status.as_u16()),
        reason: format!("{} returned {}: {}", operation, status, body.describe()),
    })
}

async fn error_body(response: Response) -> ErrorBody {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str(&text).unwrap_or_else(|_| ErrorBody {
        error: (!text.trim().is_empty()).then(|| text.trim().to_string()),
        ..ErrorBody::default()
    })
}

async fn decode<T: DeserializeOwned>(operation: Operation, response: Response) -> Result<T, UploadError> {
    let text = response
        .text()
        .await
        .map_err(|e| network_error(operation, e).into_fatal(1))?;

    serde_json::from_str(&text).map_err(|e| {
        UploadError::ProtocolViolation(format!("{} returned malformed body: {}", operation, e))
    })
}

// ============================================================================
// Mock Transport
// ============================================================================

/// In-memory backend for orchestrator tests
#[cfg(test)]
pub struct MockTransport {
    pub state: parking_lot::Mutex<MockState>,
}

#[cfg(test)]
#[derive(Default)]
pub struct MockState {
    /// Chunk size handed out by `init`
    pub chunk_size: Option<usize>,
    pub next_id: usize,
    pub uploads: std::collections::HashMap<String, std::collections::BTreeMap<usize, Vec<u8>>>,
    /// Every call in order: "init", "status", "chunk:N", "complete", "cleanup"
    pub calls: Vec<String>,
    /// Indices whose upload always fails terminally
    pub failing_chunks: std::collections::HashSet<usize>,
    /// Extra indices reported by `status`
    pub phantom_chunks: Vec<usize>,
    /// Transient failures `complete` returns before succeeding
    pub complete_transient_failures: u32,
    pub corrupt_on_complete: bool,
    pub fail_cleanup: bool,
}

#[cfg(test)]
impl MockTransport {
    pub fn new(chunk_size: Option<usize>) -> Self {
        Self {
            state: parking_lot::Mutex::new(MockState {
                chunk_size,
                ..MockState::default()
            }),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn chunk_calls(&self) -> Vec<usize> {
        self.calls()
            .iter()
            .filter_map(|c| c.strip_prefix("chunk:"))
            .filter_map(|i| i.parse().ok())
            .collect()
    }

    pub fn assembled(&self, upload_id: &str) -> Vec<u8> {
        self.state
            .lock()
            .uploads
            .get(upload_id)
            .map(|chunks| chunks.values().flatten().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl UploadTransport for MockTransport {
    async fn init(&self, _request: &InitRequest) -> Result<InitResponse, UploadError> {
        let mut state = self.state.lock();
        state.calls.push("init".to_string());
        state.next_id += 1;
        let upload_id = format!("U{}", state.next_id);
        state.uploads.insert(upload_id.clone(), Default::default());

        Ok(InitResponse {
            upload_id,
            chunk_size: state.chunk_size,
        })
    }

    async fn status(&self, upload_id: &str) -> Result<Vec<usize>, UploadError> {
        let mut state = self.state.lock();
        state.calls.push("status".to_string());
        let mut chunks: Vec<usize> = state
            .uploads
            .get(upload_id)
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default();
        chunks.extend(state.phantom_chunks.iter().copied());
        Ok(chunks)
    }

    async fn upload_chunk(&self, chunk: &ChunkUpload<'_>) -> Result<ChunkUploadResponse, UploadError> {
        let mut state = self.state.lock();
        state.calls.push(format!("chunk:{}", chunk.chunk_index));

        if state.failing_chunks.contains(&chunk.chunk_index) {
            return Err(UploadError::FatalTransport {
                operation: Operation::UploadChunk,
                attempts: 3,
                status: Some(503),
                reason: format!("chunk {} failed", chunk.chunk_index),
            });
        }
        if let Some(hash) = chunk.chunk_hash {
            if !super::hasher::verify_hash(chunk.data, hash) {
                return Err(UploadError::FatalTransport {
                    operation: Operation::UploadChunk,
                    attempts: 3,
                    status: Some(400),
                    reason: "chunk hash mismatch".to_string(),
                });
            }
        }

        let Some(stored) = state.uploads.get_mut(chunk.upload_id) else {
            return Err(UploadError::SessionExpired(chunk.upload_id.to_string()));
        };
        let skipped = stored.contains_key(&chunk.chunk_index);
        stored
            .entry(chunk.chunk_index)
            .or_insert_with(|| chunk.data.to_vec());

        Ok(ChunkUploadResponse {
            success: true,
            chunk_index: chunk.chunk_index,
            skipped,
            message: None,
        })
    }

    async fn complete(&self, request: &CompleteRequest) -> Result<CompleteResponse, UploadError> {
        {
            let mut state = self.state.lock();
            state.calls.push("complete".to_string());
            if state.complete_transient_failures > 0 {
                state.complete_transient_failures -= 1;
                return Err(UploadError::Transient {
                    operation: Operation::Complete,
                    status: Some(502),
                    reason: "bad gateway".to_string(),
                });
            }
        }

        let mut assembled = self.assembled(&request.upload_id);
        if self.state.lock().corrupt_on_complete {
            assembled.push(0);
        }
        let actual = super::hasher::compute_hash(&assembled);
        if !actual.eq_ignore_ascii_case(&request.file_hash) {
            return Err(UploadError::Integrity {
                expected: request.file_hash.clone(),
                actual: Some(actual),
            });
        }

        Ok(CompleteResponse {
            success: true,
            file_url: Some(format!("/files/{}", request.upload_id)),
            message: None,
        })
    }

    async fn cleanup(&self, upload_id: &str) -> Result<CleanupResponse, UploadError> {
        let mut state = self.state.lock();
        state.calls.push("cleanup".to_string());
        if state.fail_cleanup {
            return Err(UploadError::FatalTransport {
                operation: Operation::Cleanup,
                attempts: 1,
                status: Some(500),
                reason: "disk busy".to_string(),
            });
        }

        let deleted = state.uploads.remove(upload_id).map(|c| c.len());
        Ok(CleanupResponse {
            message: "Upload cleaned up successfully".to_string(),
            upload_id: Some(upload_id.to_string()),
            deleted_files: deleted,
        })
    }
}
