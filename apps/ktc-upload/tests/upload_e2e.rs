//! End-to-end tests: the real HTTP transport against the reference backend
//! and against stub servers with scripted failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::json;
use tempfile::TempDir;

use ktc_upload::config::Config;
use ktc_upload::error::{ErrorKind, Operation, UploadError};
use ktc_upload::routes;
use ktc_upload::state::AppState;
use ktc_upload::storage::ChunkStore;
use ktc_upload::upload::{
    compute_hash, ChunkUpload, CompleteRequest, FileSource, InitRequest, RetryPolicy,
    TransportClient, UploadOrchestrator, UploadSession, UploadTransport,
};

const MB: usize = 1024 * 1024;

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10), 2)
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Reference backend on an ephemeral port, returns its origin
async fn spawn_backend(chunk_size: usize) -> (TempDir, String) {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::open(dir.path().join("store"), chunk_size).await.unwrap();
    let origin = serve(routes::app(AppState::with_store(Config::default(), store))).await;
    (dir, origin)
}

async fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> FileSource {
    let path = dir.path().join(name);
    tokio::fs::write(&path, data).await.unwrap();
    FileSource::open(&path).await.unwrap()
}

fn client(origin: &str) -> TransportClient {
    TransportClient::new(format!("{}/api", origin), fast_retry()).unwrap()
}

// ============================================================================
// Reference backend
// ============================================================================

#[tokio::test]
async fn uploads_file_in_server_sized_chunks() {
    let (dir, origin) = spawn_backend(MB).await;
    let data = test_data(5 * MB / 2);
    let source = write_file(&dir, "room.jpg", &data).await;

    let mut orchestrator = UploadOrchestrator::new(client(&origin), 2 * MB).with_retry_policy(fast_retry());
    let outcome = orchestrator.upload(&source, "room-42").await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.file_url, Some(format!("/files/{}", outcome.upload_id)));
    let session = orchestrator.session().unwrap();
    assert_eq!(session.chunk_size(), MB);
    assert_eq!(session.total_chunks(), 3);

    let served = reqwest::get(format!("{}/files/{}", origin, outcome.upload_id))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(served.as_ref(), data.as_slice());

    // Chunks were cleaned up after completion
    let transport = client(&origin);
    assert!(transport.status(&outcome.upload_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn resumes_interrupted_upload_with_new_orchestrator() {
    let (dir, origin) = spawn_backend(1000).await;
    let data = test_data(4500);
    let source = write_file(&dir, "contract.pdf", &data).await;

    let first = UploadOrchestrator::new(client(&origin), 1000).with_retry_policy(fast_retry());
    let abort = first.abort_handle();
    let mut first = first.on_progress(move |p| {
        if p.chunks_uploaded == 2 {
            abort.abort();
        }
    });
    let err = first.upload(&source, "contract-9").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let session = first.session().cloned().unwrap();
    let transport = client(&origin);
    assert_eq!(transport.status(session.upload_id()).await.unwrap(), vec![0, 1]);

    let sent = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&sent);
    let mut second = UploadOrchestrator::new(client(&origin), 1000)
        .with_retry_policy(fast_retry())
        .with_session(session.clone())
        .on_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let outcome = second.upload(&source, "contract-9").await.unwrap();

    assert_eq!(outcome.upload_id, session.upload_id());
    // One report after status, then one per remaining chunk (2, 3, 4)
    assert_eq!(sent.load(Ordering::SeqCst), 4);

    let served = reqwest::get(format!("{}/files/{}", origin, outcome.upload_id))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(served.as_ref(), data.as_slice());
}

#[tokio::test]
async fn hash_mismatch_keeps_chunks_until_cleanup() {
    let (_dir, origin) = spawn_backend(MB).await;
    let transport = client(&origin);
    let data = test_data(5 * MB / 2);

    let init = transport
        .init(&InitRequest {
            filename: "room.jpg".to_string(),
            total_chunks: 2,
            total_size: data.len() as u64,
            file_hash: None,
        })
        .await
        .unwrap();
    assert_eq!(init.chunk_size, Some(MB));

    for (index, chunk) in data.chunks(MB).enumerate() {
        let hash = compute_hash(chunk);
        let reply = transport
            .upload_chunk(&ChunkUpload {
                upload_id: &init.upload_id,
                chunk_index: index,
                total_chunks: 3,
                filename: "room.jpg",
                data: chunk,
                chunk_hash: Some(&hash),
            })
            .await
            .unwrap();
        assert!(reply.success);
        assert_eq!(reply.chunk_index, index);
    }

    let err = transport
        .complete(&CompleteRequest {
            upload_id: init.upload_id.clone(),
            filename: "room.jpg".to_string(),
            file_hash: compute_hash(b"something else"),
            owner_reference: "room-42".to_string(),
        })
        .await
        .unwrap_err();
    match err {
        UploadError::Integrity { actual, .. } => assert_eq!(actual, Some(compute_hash(&data))),
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(transport.status(&init.upload_id).await.unwrap(), vec![0, 1, 2]);
    let cleanup = transport.cleanup(&init.upload_id).await.unwrap();
    assert_eq!(cleanup.deleted_files, Some(3));
}

#[tokio::test]
async fn forgotten_upload_restarts_from_init() {
    let (dir, origin) = spawn_backend(1000).await;
    let data = test_data(2500);
    let source = write_file(&dir, "room.jpg", &data).await;
    let lost_id = uuid::Uuid::new_v4().to_string();
    let lost = UploadSession::new(&lost_id, "room.jpg", 2500, 1000, compute_hash(&data)).unwrap();

    let mut orchestrator = UploadOrchestrator::new(client(&origin), 1000)
        .with_retry_policy(fast_retry())
        .with_session(lost);

    let err = orchestrator.upload(&source, "room-42").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionExpired);
    assert!(orchestrator.session().is_none());

    let outcome = orchestrator.upload(&source, "room-42").await.unwrap();
    assert_ne!(outcome.upload_id, lost_id);

    let served = reqwest::get(format!("{}/files/{}", origin, outcome.upload_id))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(served.as_ref(), data.as_slice());
}

#[tokio::test]
async fn status_of_unknown_upload_is_empty() {
    let (_dir, origin) = spawn_backend(MB).await;
    let transport = client(&origin);

    assert!(transport.status("no-such-upload").await.unwrap().is_empty());
    assert!(transport
        .status(&uuid::Uuid::new_v4().to_string())
        .await
        .unwrap()
        .is_empty());
}

// ============================================================================
// Stub servers
// ============================================================================

async fn count(State(hits): State<Arc<AtomicUsize>>) {
    hits.fetch_add(1, Ordering::SeqCst);
}

#[tokio::test]
async fn chunk_upload_gives_up_after_three_attempts() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/api/upload/chunk",
            post(|state: State<Arc<AtomicUsize>>| async move {
                count(state).await;
                (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "busy"})))
            }),
        )
        .with_state(Arc::clone(&hits));
    let transport = client(&serve(app).await);

    let started = Instant::now();
    let err = transport
        .upload_chunk(&ChunkUpload {
            upload_id: "U1",
            chunk_index: 0,
            total_chunks: 1,
            filename: "room.jpg",
            data: b"abc",
            chunk_hash: None,
        })
        .await
        .unwrap_err();

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(30));
    match err {
        UploadError::FatalTransport {
            operation,
            attempts,
            status,
            ..
        } => {
            assert_eq!(operation, Operation::UploadChunk);
            assert_eq!(attempts, 3);
            assert_eq!(status, Some(503));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn init_client_error_is_not_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/api/upload/init",
            post(|state: State<Arc<AtomicUsize>>| async move {
                count(state).await;
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "Filename is required", "code": "VALIDATION_ERROR"})),
                )
            }),
        )
        .with_state(Arc::clone(&hits));
    let transport = client(&serve(app).await);

    let err = transport
        .init(&InitRequest {
            filename: String::new(),
            total_chunks: 1,
            total_size: 1,
            file_hash: None,
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn init_server_error_is_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/api/upload/init",
            post(|State(hits): State<Arc<AtomicUsize>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    (StatusCode::BAD_GATEWAY, Json(json!({"error": "upstream"})))
                } else {
                    (StatusCode::OK, Json(json!({"uploadId": "U1", "chunkSize": 1024})))
                }
            }),
        )
        .with_state(Arc::clone(&hits));
    let transport = client(&serve(app).await);

    let reply = transport
        .init(&InitRequest {
            filename: "room.jpg".to_string(),
            total_chunks: 1,
            total_size: 10,
            file_hash: None,
        })
        .await
        .unwrap();

    assert_eq!(reply.upload_id, "U1");
    assert_eq!(reply.chunk_size, Some(1024));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn wrong_chunk_acknowledgement_is_protocol_violation() {
    let app = Router::new().route(
        "/api/upload/chunk",
        post(|| async { Json(json!({"success": true, "chunkIndex": 5})) }),
    );
    let transport = client(&serve(app).await);

    let err = transport
        .upload_chunk(&ChunkUpload {
            upload_id: "U1",
            chunk_index: 0,
            total_chunks: 1,
            filename: "room.jpg",
            data: b"abc",
            chunk_hash: None,
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
}

#[tokio::test]
async fn complete_server_error_is_left_to_caller() {
    let app = Router::new().route(
        "/api/upload/complete",
        post(|| async { (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "busy"}))) }),
    );
    let transport = client(&serve(app).await);

    let err = transport
        .complete(&CompleteRequest {
            upload_id: "U1".to_string(),
            filename: "room.jpg".to_string(),
            file_hash: "00".to_string(),
            owner_reference: "room-42".to_string(),
        })
        .await
        .unwrap_err();

    assert!(err.is_transient());
}
