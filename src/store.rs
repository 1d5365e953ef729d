//! Artifact persistence partitioned by owner and model id

use crate::error::{ServeError, ServeResult};
use crate::format::ModelFormat;
use crate::state::{FileSystemStorage, StorageBackend};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Longest owner id used verbatim as a directory name
const MAX_PLAIN_OWNER_LEN: usize = 64;

/// Accepted bytes on persistent storage. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelArtifact {
    /// Lowercase hex SHA-256 of the stored bytes
    pub checksum: String,
    pub format: ModelFormat,
    pub size_bytes: u64,
    /// Relative to the store root
    pub storage_path: PathBuf,
}

pub struct ArtifactStore {
    root: PathBuf,
    storage: Arc<dyn StorageBackend>,
}

impl ArtifactStore {
    pub fn new_with_storage(root: PathBuf, storage: Arc<dyn StorageBackend>) -> Self {
        Self { root, storage }
    }

    pub fn new(root: PathBuf) -> Self {
        Self::new_with_storage(root, Arc::new(FileSystemStorage::new()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write accepted bytes under `<owner>/<model_id>/model.<ext>`.
    ///
    /// The write goes through the backend's temp-file rename, so either the
    /// whole artifact becomes visible or nothing does.
    pub async fn store(
        &self,
        owner_id: &str,
        model_id: &str,
        format: ModelFormat,
        bytes: &[u8],
    ) -> ServeResult<ModelArtifact> {
        let checksum = hex::encode(Sha256::digest(bytes));
        let storage_path = PathBuf::from(owner_dir(owner_id))
            .join(model_id)
            .join(format!("model.{}", format.extension()));
        let absolute = self.root.join(&storage_path);

        self.storage.save(&absolute, bytes).await.map_err(|e| {
            tracing::error!(
                model_id = %model_id,
                path = %absolute.display(),
                error = %format!("{:#}", e),
                "Failed to store artifact"
            );
            ServeError::storage(format!("{:#}", e))
        })?;

        tracing::info!(
            model_id = %model_id,
            format = %format,
            size = bytes.len(),
            checksum = %checksum,
            "Artifact stored"
        );

        Ok(ModelArtifact {
            checksum,
            format,
            size_bytes: bytes.len() as u64,
            storage_path,
        })
    }

    /// Absolute location of a stored artifact
    pub fn path_of(&self, artifact: &ModelArtifact) -> PathBuf {
        self.root.join(&artifact.storage_path)
    }

    pub fn contains(&self, artifact: &ModelArtifact) -> bool {
        self.storage.exists(&self.path_of(artifact))
    }

    /// Delete the artifact file and its now-empty model directory
    pub async fn remove(&self, artifact: &ModelArtifact) -> ServeResult<()> {
        let path = self.path_of(artifact);
        self.storage
            .remove(&path)
            .await
            .map_err(|e| ServeError::storage(format!("{:#}", e)))?;

        if let Some(dir) = path.parent()
            && dir.starts_with(&self.root)
            && dir != self.root
        {
            // fails harmlessly when the directory is not empty or never existed
            let _ = tokio::fs::remove_dir(dir).await;
        }

        tracing::debug!(path = %path.display(), "Artifact removed");
        Ok(())
    }
}

/// Directory name for an owner: verbatim when it is a plain token, else hashed
fn owner_dir(owner_id: &str) -> String {
    let plain = !owner_id.is_empty()
        && owner_id.len() <= MAX_PLAIN_OWNER_LEN
        && owner_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if plain {
        owner_id.to_string()
    } else {
        let digest = hex::encode(Sha256::digest(owner_id.as_bytes()));
        format!("h-{}", &digest[..32])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_and_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path().to_path_buf());

        let artifact = store
            .store("alice", "m-1", ModelFormat::Onnx, b"graph bytes")
            .await
            .unwrap();

        assert_eq!(artifact.size_bytes, 11);
        assert_eq!(artifact.checksum.len(), 64);
        assert_eq!(artifact.storage_path, PathBuf::from("alice/m-1/model.onnx"));
        assert_eq!(std::fs::read(store.path_of(&artifact)).unwrap(), b"graph bytes");
        assert!(store.contains(&artifact));

        store.remove(&artifact).await.unwrap();
        assert!(!store.contains(&artifact));
        assert!(!temp_dir.path().join("alice/m-1").exists());
    }

    #[tokio::test]
    async fn test_identical_bytes_get_independent_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path().to_path_buf());

        let a = store.store("alice", "a", ModelFormat::Pickle, b"same").await.unwrap();
        let b = store.store("bob", "b", ModelFormat::Pickle, b"same").await.unwrap();

        assert_eq!(a.checksum, b.checksum);
        assert_ne!(a.storage_path, b.storage_path);

        store.remove(&a).await.unwrap();
        assert!(store.contains(&b));
    }

    #[test]
    fn test_owner_dir_hashes_unsafe_ids() {
        assert_eq!(owner_dir("user_42"), "user_42");
        let hashed = owner_dir("../etc");
        assert!(hashed.starts_with("h-"));
        assert_eq!(hashed.len(), 34);
        assert!(owner_dir(&"x".repeat(65)).starts_with("h-"));
    }

    #[tokio::test]
    async fn test_storage_failure_is_storage_error() {
        let temp_dir = TempDir::new().unwrap();
        // a file where the owner directory should be
        std::fs::write(temp_dir.path().join("alice"), b"not a dir").unwrap();
        let store = ArtifactStore::new(temp_dir.path().to_path_buf());

        let err = store
            .store("alice", "m", ModelFormat::Onnx, b"x")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }
}
