//! Upload Routes
//!
//! HTTP endpoints of the chunked upload protocol.
//!
//! Endpoints:
//! - POST /api/upload/init - Open an upload, returns its ID and chunk size
//! - GET /api/upload/status?uploadId= - Chunk indices already stored
//! - POST /api/upload/chunk - Store one chunk (multipart)
//! - POST /api/upload/complete - Assemble and verify the file
//! - POST /api/upload/cleanup?uploadId= - Delete stored chunks
//! - GET /api/upload/resume?uploadId=&totalChunks= - Completed and missing chunks

use axum::{
    extract::{Multipart, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::upload::types::{
    ChunkUploadResponse, CleanupResponse, CompleteRequest, CompleteResponse, InitRequest,
    InitResponse, ResumeResponse, StatusResponse,
};

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/init", post(init))
        .route("/status", get(status))
        .route("/chunk", post(upload_chunk))
        .route("/complete", post(complete))
        .route("/cleanup", post(cleanup))
        .route("/resume", get(resume))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadIdQuery {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeQuery {
    upload_id: String,
    total_chunks: Option<usize>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/upload/init
async fn init(
    State(state): State<AppState>,
    Json(request): Json<InitRequest>,
) -> Result<Json<InitResponse>> {
    if request.total_size == 0 {
        return Err(AppError::BadRequest(
            "totalSize must be greater than zero".to_string(),
        ));
    }

    let record = state
        .store()
        .create_upload(&request.filename, request.total_size, request.file_hash)
        .await?;

    if record.total_chunks != request.total_chunks {
        tracing::debug!(
            upload_id = %record.upload_id,
            client_total_chunks = request.total_chunks,
            total_chunks = record.total_chunks,
            "Client will re-slice with the server chunk size"
        );
    }

    Ok(Json(InitResponse {
        upload_id: record.upload_id,
        chunk_size: Some(record.chunk_size),
    }))
}

/// GET /api/upload/status?uploadId=
async fn status(
    State(state): State<AppState>,
    Query(query): Query<UploadIdQuery>,
) -> Result<Json<StatusResponse>> {
    let listing = state.store().list_chunks(&query.upload_id).await?;

    Ok(Json(StatusResponse {
        can_resume: Some(!listing.chunks.is_empty()),
        uploaded_size: Some(listing.uploaded_size),
        upload_id: Some(query.upload_id),
        chunks: listing.chunks,
    }))
}

/// Fields of a chunk submission
struct ChunkForm {
    upload_id: String,
    chunk_index: usize,
    total_chunks: Option<usize>,
    filename: Option<String>,
    chunk_hash: Option<String>,
    data: Vec<u8>,
}

impl ChunkForm {
    async fn parse(mut multipart: Multipart) -> Result<Self> {
        let mut upload_id = None;
        let mut chunk_index = None;
        let mut total_chunks = None;
        let mut filename = None;
        let mut chunk_hash = None;
        let mut data = None;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "chunk" {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read chunk: {}", e)))?;
                data = Some(bytes.to_vec());
                continue;
            }

            let value = field
                .text()
                .await
                .map_err(|e| AppError::BadRequest(format!("Failed to read {}: {}", name, e)))?;
            match name.as_str() {
                "uploadId" => upload_id = Some(value),
                "chunkIndex" => chunk_index = Some(parse_number("chunkIndex", &value)?),
                "totalChunks" => total_chunks = Some(parse_number("totalChunks", &value)?),
                "filename" => filename = Some(value),
                "chunkHash" => chunk_hash = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            upload_id: upload_id.ok_or_else(|| missing_field("uploadId"))?,
            chunk_index: chunk_index.ok_or_else(|| missing_field("chunkIndex"))?,
            total_chunks,
            filename,
            chunk_hash,
            data: data.ok_or_else(|| missing_field("chunk"))?,
        })
    }
}

/// POST /api/upload/chunk
async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>> {
    let form = ChunkForm::parse(multipart).await?;

    let stored = state
        .store()
        .store_chunk(
            &form.upload_id,
            form.chunk_index,
            &form.data,
            form.chunk_hash.as_deref(),
        )
        .await?;

    tracing::debug!(
        upload_id = %form.upload_id,
        chunk_index = stored.index,
        total_chunks = ?form.total_chunks,
        filename = ?form.filename,
        size = stored.size,
        skipped = stored.skipped,
        "Chunk received"
    );

    Ok(Json(ChunkUploadResponse {
        success: true,
        chunk_index: stored.index,
        skipped: stored.skipped,
        message: stored.skipped.then(|| "Chunk already exists".to_string()),
    }))
}

/// POST /api/upload/complete
async fn complete(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>> {
    let file = state
        .store()
        .assemble(&request.upload_id, &request.filename, &request.file_hash)
        .await?;

    tracing::info!(
        upload_id = %request.upload_id,
        owner_reference = %request.owner_reference,
        size = file.size,
        "Upload complete"
    );

    Ok(Json(CompleteResponse {
        success: true,
        file_url: Some(format!("/files/{}", request.upload_id)),
        message: Some("File uploaded successfully".to_string()),
    }))
}

/// POST /api/upload/cleanup?uploadId=
async fn cleanup(
    State(state): State<AppState>,
    Query(query): Query<UploadIdQuery>,
) -> Result<Json<CleanupResponse>> {
    let deleted = state.store().delete_chunks(&query.upload_id).await?;

    let message = match deleted {
        Some(_) => "Upload cleaned up successfully",
        None => "Upload directory not found",
    };

    Ok(Json(CleanupResponse {
        message: message.to_string(),
        upload_id: Some(query.upload_id),
        deleted_files: deleted,
    }))
}

/// GET /api/upload/resume?uploadId=&totalChunks=
///
/// `totalChunks` defaults to the count recorded at init.
async fn resume(
    State(state): State<AppState>,
    Query(query): Query<ResumeQuery>,
) -> Result<Json<ResumeResponse>> {
    let total_chunks = match query.total_chunks {
        Some(total) => total,
        None => state.store().get_upload(&query.upload_id).await?.total_chunks,
    };

    let listing = state.store().list_chunks(&query.upload_id).await?;
    let completed_chunks: Vec<usize> = listing
        .chunks
        .into_iter()
        .filter(|&i| i < total_chunks)
        .collect();
    let missing_chunks: Vec<usize> = (0..total_chunks)
        .filter(|i| completed_chunks.binary_search(i).is_err())
        .collect();

    Ok(Json(ResumeResponse {
        upload_id: query.upload_id,
        total_chunks,
        is_complete: missing_chunks.is_empty(),
        completed_chunks,
        missing_chunks,
    }))
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_number(field: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::BadRequest(format!("{} must be a non-negative integer", field)))
}

fn missing_field(field: &str) -> AppError {
    AppError::BadRequest(format!("{} is required", field))
}

// ============================================================================
// Tests
// ============================================================================
