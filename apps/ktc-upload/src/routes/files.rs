//! File serving routes
//!
//! Serves assembled uploads from the chunk store.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Router,
};

use crate::error::{AppError, Result, StorageError};
use crate::state::AppState;

/// Create the files router
pub fn router() -> Router<AppState> {
    Router::new().route("/:upload_id", get(serve_file))
}

/// GET /files/:upload_id
async fn serve_file(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Response> {
    let path = state
        .store()
        .find_file(&upload_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No assembled file for upload {}", upload_id)))?;

    let bytes = tokio::fs::read(&path).await.map_err(StorageError::from)?;

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| upload_id.clone());

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, guess_content_type(&filename))
        .header(header::CONTENT_LENGTH, bytes.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", filename),
        )
        .body(Body::from(bytes))
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Guess content type from file extension
fn guess_content_type(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or("");
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json",
        "zip" => "application/zip",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("room.JPG"), "image/jpeg");
        assert_eq!(guess_content_type("contract.pdf"), "application/pdf");
        assert_eq!(guess_content_type("archive"), "application/octet-stream");
    }
}
