//! Wire types for the chunked upload protocol
//!
//! Field names are part of the compatibility surface with the backend and
//! are serialized in camelCase.

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Default chunk size: 2MB
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Maximum attempts for retried operations
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff base delay in milliseconds
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Error code the backend uses when the assembled file does not match `fileHash`
pub const FILE_HASH_MISMATCH_CODE: &str = "FILE_HASH_MISMATCH";

// ============================================================================
// Init
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub filename: String,
    pub total_chunks: usize,
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub upload_id: String,
    /// Chunk size the backend wants; overrides the client's provisional size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Chunk indices already stored by the backend
    #[serde(default)]
    pub chunks: Vec<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_resume: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub upload_id: String,
    pub total_chunks: usize,
    pub completed_chunks: Vec<usize>,
    pub missing_chunks: Vec<usize>,
    pub is_complete: bool,
}

// ============================================================================
// Chunk Upload
// ============================================================================

/// One chunk submission, sent as a multipart form
#[derive(Debug, Clone)]
pub struct ChunkUpload<'a> {
    pub upload_id: &'a str,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub filename: &'a str,
    pub data: &'a [u8],
    pub chunk_hash: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub success: bool,
    pub chunk_index: usize,
    /// Set when the backend already had this index and did nothing
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Complete
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub upload_id: String,
    pub filename: String,
    pub file_hash: String,
    /// Entity the file belongs to (a room, a contract...)
    #[serde(alias = "roomId")]
    pub owner_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Cleanup
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_files: Option<usize>,
}

// ============================================================================
// Errors
// ============================================================================

/// Error body returned by the backend on non-2xx responses
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub actual: Option<String>,
}

impl ErrorBody {
    /// Whether the body reports a whole-file hash mismatch
    pub fn is_file_hash_mismatch(&self) -> bool {
        if self.code.as_deref() == Some(FILE_HASH_MISMATCH_CODE) {
            return true;
        }
        self.error
            .as_deref()
            .map(|e| e.to_ascii_lowercase().contains("file hash"))
            .unwrap_or(false)
    }

    /// Best human-readable description of the failure
    pub fn describe(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "no error body".to_string())
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Final result of a successful transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub success: bool,
    pub upload_id: String,
    pub file_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_request_omits_missing_hash() {
        let request = InitRequest {
            filename: "room.jpg".to_string(),
            total_chunks: 3,
            total_size: 2_621_440,
            file_hash: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"filename": "room.jpg", "totalChunks": 3, "totalSize": 2621440})
        );
    }

    #[test]
    fn test_status_response_tolerates_missing_chunks() {
        let status: StatusResponse = serde_json::from_str("{}").unwrap();
        assert!(status.chunks.is_empty());
    }

    #[test]
    fn test_complete_request_accepts_room_id_alias() {
        let request: CompleteRequest = serde_json::from_str(
            r#"{"uploadId":"U1","filename":"a.pdf","fileHash":"ff","roomId":"room-7"}"#,
        )
        .unwrap();
        assert_eq!(request.owner_reference, "room-7");
    }

    #[test]
    fn test_error_body_detects_hash_mismatch() {
        let by_code: ErrorBody =
            serde_json::from_str(r#"{"error":"x","code":"FILE_HASH_MISMATCH"}"#).unwrap();
        assert!(by_code.is_file_hash_mismatch());

        let by_text: ErrorBody =
            serde_json::from_str(r#"{"error":"File hash verification failed"}"#).unwrap();
        assert!(by_text.is_file_hash_mismatch());

        let other: ErrorBody =
            serde_json::from_str(r#"{"error":"Upload not found","code":"SESSION_NOT_FOUND"}"#)
                .unwrap();
        assert!(!other.is_file_hash_mismatch());
    }
}
