//! Error types for the KTC upload client and reference backend

use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Client Errors
// ============================================================================

/// Protocol operation a transport error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Init,
    Status,
    UploadChunk,
    Complete,
    Cleanup,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Init => "init",
            Operation::Status => "status",
            Operation::UploadChunk => "upload-chunk",
            Operation::Complete => "complete",
            Operation::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Coarse classification of an [`UploadError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    TransientTransport,
    FatalTransport,
    Integrity,
    ProtocolViolation,
    SessionBusy,
    SessionExpired,
    Cancelled,
    Io,
    Internal,
}

/// Upload client error
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{operation} failed transiently: {reason}")]
    Transient {
        operation: Operation,
        status: Option<u16>,
        reason: String,
    },

    #[error("{operation} failed after {attempts} attempt(s): {reason}")]
    FatalTransport {
        operation: Operation,
        attempts: u32,
        status: Option<u16>,
        reason: String,
    },

    #[error("File hash mismatch: expected {expected}, got {}", .actual.as_deref().unwrap_or("unknown"))]
    Integrity {
        expected: String,
        actual: Option<String>,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Upload {0} is already being driven by another orchestrator")]
    SessionBusy(String),

    /// The backend no longer knows the upload, only a fresh init can continue
    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Transient { .. } => ErrorKind::TransientTransport,
            Self::FatalTransport { .. } => ErrorKind::FatalTransport,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::SessionBusy(_) => ErrorKind::SessionBusy,
            Self::SessionExpired(_) => ErrorKind::SessionExpired,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry policy may attempt the operation again
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether the session behind this error cannot be resumed
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Self::Integrity { .. } | Self::SessionExpired(_))
    }

    /// Convert a transient error into a terminal one after `attempts` tries.
    /// Other errors pass through unchanged.
    pub fn into_fatal(self, attempts: u32) -> Self {
        match self {
            Self::Transient {
                operation,
                status,
                reason,
            } => Self::FatalTransport {
                operation,
                attempts,
                status,
                reason,
            },
            other => other,
        }
    }
}

// ============================================================================
// Reference Backend Errors
// ============================================================================

/// Chunk store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload not found: {0}")]
    UploadNotFound(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Chunk hash mismatch: expected {expected}, got {actual}")]
    ChunkHashMismatch { expected: String, actual: String },

    #[error("File hash mismatch: expected {expected}, got {actual}")]
    FileHashMismatch { expected: String, actual: String },

    #[error("Chunk index {index} out of bounds (total chunks: {total})")]
    ChunkIndexOutOfBounds { index: usize, total: usize },

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("Missing chunks: {0:?}")]
    MissingChunks(Vec<usize>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP-facing error of the reference backend
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Application-wide result type for route handlers
pub type Result<T> = std::result::Result<T, AppError>;

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            AppError::Storage(e) => match e {
                StorageError::UploadNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
                StorageError::InvalidName(_)
                | StorageError::ChunkIndexOutOfBounds { .. }
                | StorageError::ChunkSizeMismatch { .. } => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                }
                StorageError::ChunkHashMismatch { .. } => {
                    (StatusCode::BAD_REQUEST, "CHUNK_HASH_MISMATCH")
                }
                StorageError::FileHashMismatch { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "FILE_HASH_MISMATCH")
                }
                StorageError::MissingChunks(_) => (StatusCode::BAD_REQUEST, "MISSING_CHUNKS"),
                StorageError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let (expected, actual) = match &self {
            AppError::Storage(StorageError::ChunkHashMismatch { expected, actual })
            | AppError::Storage(StorageError::FileHashMismatch { expected, actual }) => {
                (Some(expected.clone()), Some(actual.clone()))
            }
            _ => (None, None),
        };

        let error = match &self {
            AppError::Storage(StorageError::Io(e)) => {
                tracing::error!("Storage error: {}", e);
                "Storage error".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error,
            code,
            expected,
            actual,
        });

        (status, body).into_response()
    }
}
