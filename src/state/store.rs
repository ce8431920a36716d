//! State stores
//!
//! Where bookmarks live between runs.

use super::types::BookmarkState;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Persistence backend for bookmark state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved state, empty if none
    async fn load(&self) -> Result<BookmarkState>;

    /// Replace the saved state
    async fn save(&self, state: &BookmarkState) -> Result<()>;
}

/// JSON file store with atomic replacement
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Create a store backed by `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the state file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<BookmarkState> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(BookmarkState::new());
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::state(format!("Failed to read state file: {e}")))?;

        if contents.trim().is_empty() {
            return Ok(BookmarkState::new());
        }

        serde_json::from_str(&contents)
            .map_err(|e| Error::state(format!("Failed to parse state file: {e}")))
    }

    async fn save(&self, state: &BookmarkState) -> Result<()> {
        let contents = serde_json::to_string_pretty(state)
            .map_err(|e| Error::state(format!("Failed to serialize state: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::state(format!("Failed to create state directory: {e}")))?;
        }

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &contents)
            .await
            .map_err(|e| Error::state(format!("Failed to write state file: {e}")))?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| Error::state(format!("Failed to rename state file: {e}")))?;

        Ok(())
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RwLock<BookmarkState>,
}

impl MemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `state`
    pub fn with_state(state: BookmarkState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Current contents
    pub async fn current(&self) -> BookmarkState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<BookmarkState> {
        Ok(self.state.read().await.clone())
    }

    async fn save(&self, state: &BookmarkState) -> Result<()> {
        *self.state.write().await = state.clone();
        Ok(())
    }
}
