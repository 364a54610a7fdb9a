//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::error::StorageError;
use crate::storage::ChunkStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    store: ChunkStore,
}

impl AppState {
    /// Open the chunk store described by `config`
    pub async fn new(config: Config) -> Result<Self, StorageError> {
        let store = ChunkStore::open(&config.storage.upload_dir, config.storage.chunk_size).await?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: ChunkStore) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, store }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the chunk store
    pub fn store(&self) -> &ChunkStore {
        &self.inner.store
    }
}
