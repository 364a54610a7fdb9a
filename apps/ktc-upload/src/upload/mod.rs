//! Resumable Chunked Upload Client
//!
//! Transfers large files in fixed-size chunks with:
//! - SHA-256 integrity for every chunk and the whole file
//! - Resume after interruption by re-querying the stored chunks
//! - Bounded exponential backoff for transient failures
//!
//! Protocol Flow:
//! 1. Client opens an upload with `init` and receives an upload ID
//! 2. Client asks `status` which chunks the backend already holds
//! 3. Client uploads the missing chunks in index order
//! 4. Client calls `complete`, the backend assembles and verifies the file
//! 5. Client calls `cleanup` to drop the temporary chunks

pub mod hasher;
pub mod orchestrator;
pub mod retry;
pub mod session;
pub mod slicer;
pub mod source;
pub mod transport;
pub mod types;

pub use hasher::{compute_hash, hash_source, verify_hash, FileHasher};
pub use orchestrator::{AbortHandle, UploadEvent, UploadOrchestrator, UploadProgress, UploadState};
pub use retry::RetryPolicy;
pub use session::{SessionClaim, SessionRegistry, UploadSession};
pub use slicer::{ChunkRange, ChunkSlicer};
pub use source::{FileSource, MemorySource, UploadSource};
pub use transport::{TransportClient, UploadTransport};
pub use types::*;
