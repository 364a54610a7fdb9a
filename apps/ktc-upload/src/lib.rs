//! KTC Upload Library
//!
//! Resumable chunked upload client plus the reference backend it talks to.
//! The server binary is in main.rs, the upload CLI in bin/ktc-upload.rs.
//!
//! # Modules
//!
//! - `upload`: Client side (slicing, hashing, retry, transport, orchestrator)
//! - `storage`: Filesystem chunk store of the reference backend
//! - `routes`: HTTP surface of the reference backend

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;
