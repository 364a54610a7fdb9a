//! Storage module for the reference backend
//!
//! Keeps chunk parts and assembled files on the local filesystem.

mod chunk_store;
mod types;

pub use chunk_store::{sanitize_filename, ChunkStore};
pub use types::*;
