//! Route modules for the KTC upload server

pub mod files;
pub mod health;
pub mod upload;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Room for multipart boundaries and text fields around one chunk
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the full application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = state.store().chunk_size() + MULTIPART_OVERHEAD;

    Router::new()
        .merge(health::router())
        .nest("/api/upload", upload::router())
        .nest("/files", files::router())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
