//! Persistence for registry metadata and the storage seam shared with the artifact store

use crate::registry::{ModelMetadata, ModelRegistry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically, creating parent directories
    async fn save(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Remove a file; removing a missing file is not an error
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Check if a file exists
    fn exists(&self, path: &Path) -> bool;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileSystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        // Atomic write: write to temp file, then rename
        let temp_file = path.with_extension("tmp");

        let write = async {
            let mut file = fs::File::create(&temp_file)
                .await
                .context("Failed to create temp file")?;
            file.write_all(content).await.context("Failed to write file")?;
            file.sync_all().await.context("Failed to sync file")?;
            fs::rename(&temp_file, path)
                .await
                .context("Failed to rename temp file")
        };

        if let Err(e) = write.await {
            // never leave a partial file behind
            let _ = fs::remove_file(&temp_file).await;
            return Err(e);
        }

        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read(path)
            .await
            .with_context(|| format!("Failed to read file: {:?}", path))?;

        Ok(Some(content))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove file: {:?}", path)),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

// ============================================================================
// State Manager with Dependency Injection
// ============================================================================

/// Persists registry metadata to a TOML state file
pub struct StateManager {
    state_file: PathBuf,
    registry: Arc<ModelRegistry>,
    storage: Arc<dyn StorageBackend>,
    /// Serializes writers so an older snapshot never overwrites a newer one
    write_lock: tokio::sync::Mutex<()>,
}

impl StateManager {
    /// Create a new state manager with custom storage backend
    pub fn new_with_storage(
        state_file: PathBuf,
        registry: Arc<ModelRegistry>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            state_file,
            registry,
            storage,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a new state manager with default filesystem storage
    pub fn new(state_file: PathBuf, registry: Arc<ModelRegistry>) -> Self {
        Self::new_with_storage(state_file, registry, Arc::new(FileSystemStorage::new()))
    }

    /// Save current registry contents to disk atomically
    pub async fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        // taken under the write lock so the snapshot is at least as new as the last save
        self.registry.take_dirty();
        let models = self.registry.snapshot().await;

        let state = SavedState {
            last_updated: chrono::Utc::now(),
            models,
        };

        let toml_content =
            toml::to_string_pretty(&state).context("Failed to serialize state to TOML")?;

        if let Err(e) = self
            .storage
            .save(&self.state_file, toml_content.as_bytes())
            .await
        {
            self.registry.mark_dirty();
            return Err(e);
        }

        tracing::debug!(
            path = ?self.state_file,
            models = state.models.len(),
            "State saved"
        );

        Ok(())
    }

    /// Save and log on failure; the next flush retries
    pub async fn persist(&self) {
        if let Err(e) = self.save().await {
            tracing::error!(error = %e, "Failed to save state");
        }
    }

    /// Load state from disk
    /// FAILS HARD if state file is corrupted - user must fix or delete
    pub async fn load(&self) -> Result<SavedState> {
        let content = self.storage.load(&self.state_file).await?;

        let content = match content {
            Some(c) => c,
            None => {
                tracing::info!("No state file found, starting fresh");
                return Ok(SavedState::default());
            }
        };

        let text = String::from_utf8(content)
            .with_context(|| format!("State file is not UTF-8: {:?}", self.state_file))?;

        let state: SavedState = toml::from_str(&text).with_context(|| {
            format!(
                "Failed to parse state file: {:?}. File may be corrupted. \
                Please delete or fix the file manually.",
                self.state_file
            )
        })?;

        tracing::info!(
            models = state.models.len(),
            last_updated = %state.last_updated,
            "State loaded from disk"
        );

        Ok(state)
    }

    /// Load the state file into the registry
    pub async fn restore(&self) -> Result<usize> {
        let state = self.load().await?;
        let count = state.models.len();
        self.registry.restore(state.models).await;
        if count > 0 {
            tracing::info!(models = count, "Registry restored from state");
        }
        Ok(count)
    }

    /// Flush usage counters whenever the registry has unsaved changes
    pub fn spawn_usage_flusher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if manager.registry.is_dirty() {
                    manager.persist().await;
                }
            }
        })
    }
}

/// Saved state format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedState {
    pub last_updated: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub models: Vec<ModelMetadata>,
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            last_updated: chrono::Utc::now(),
            models: Vec::new(),
        }
    }
}

// ============================================================================
// Test Mocks
// ============================================================================
