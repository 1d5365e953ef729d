//! Ownership-scoped model metadata registry

use crate::error::{ServeError, ServeResult};
use crate::format::ModelFormat;
use crate::safety::SafetyAssessment;
use crate::store::{ArtifactStore, ModelArtifact};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, broadcast};

pub const MIN_NAME_LEN: usize = 3;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Active,
    Inactive,
    Archived,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelStatus::Active => "active",
            ModelStatus::Inactive => "inactive",
            ModelStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// Registry record for one uploaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: ModelStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub request_count: u64,
    pub original_filename: String,
    pub format: ModelFormat,
    /// None when the upload was quarantined by the safety scan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ModelArtifact>,
    pub safety: SafetyAssessment,
}

impl ModelMetadata {
    pub fn is_active(&self) -> bool {
        self.status == ModelStatus::Active
    }

    /// Reject callers that do not own this model
    pub fn ensure_owner(&self, owner_id: &str) -> ServeResult<()> {
        if self.owner_id == owner_id {
            Ok(())
        } else {
            Err(ServeError::Forbidden {
                message: format!("model '{}' belongs to another owner", self.id),
            })
        }
    }
}

/// Fields supplied at registration; the registry fills in the rest
#[derive(Debug, Clone)]
pub struct NewModel {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub description: Option<String>,
    pub original_filename: String,
    pub format: ModelFormat,
    pub artifact: Option<ModelArtifact>,
    pub safety: SafetyAssessment,
}

/// Sparse update; unknown fields in a request body are ignored
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ModelStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub model_id: String,
    pub status: ModelStatus,
    pub request_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Events that occur during a model's lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    Registered(String),
    Updated { model_id: String, status: ModelStatus },
    Removed(String),
}

pub fn validate_name(name: &str) -> ServeResult<()> {
    let len = name.trim().chars().count();
    if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) {
        return Err(ServeError::validation(format!(
            "model name must be {}-{} characters",
            MIN_NAME_LEN, MAX_NAME_LEN
        )));
    }
    Ok(())
}

pub fn validate_description(description: &str) -> ServeResult<()> {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(ServeError::validation(format!(
            "description must be at most {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(())
}

/// Thread-safe registry of model metadata
pub struct ModelRegistry {
    models: RwLock<HashMap<String, ModelMetadata>>,
    store: Arc<ArtifactStore>,
    event_tx: broadcast::Sender<ModelEvent>,
    /// Set by any change not yet written to the state file
    dirty: AtomicBool,
}

impl ModelRegistry {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            models: RwLock::new(HashMap::new()),
            store,
            event_tx,
            dirty: AtomicBool::new(false),
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ModelEvent> {
        self.event_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub async fn register(&self, new: NewModel) -> ModelMetadata {
        let now = Utc::now();
        let metadata = ModelMetadata {
            id: new.id,
            owner_id: new.owner_id,
            name: new.name.trim().to_string(),
            description: new.description,
            status: ModelStatus::Active,
            created_at: now,
            updated_at: now,
            last_used_at: None,
            request_count: 0,
            original_filename: new.original_filename,
            format: new.format,
            artifact: new.artifact,
            safety: new.safety,
        };

        self.models
            .write()
            .await
            .insert(metadata.id.clone(), metadata.clone());
        self.mark_dirty();

        tracing::info!(
            model_id = %metadata.id,
            owner = %metadata.owner_id,
            format = %metadata.format,
            safe = metadata.safety.is_safe,
            "Model registered"
        );

        let _ = self
            .event_tx
            .send(ModelEvent::Registered(metadata.id.clone()));

        metadata
    }

    /// Look up a model; `None` when absent
    pub async fn get(&self, model_id: &str) -> Option<ModelMetadata> {
        self.models.read().await.get(model_id).cloned()
    }

    /// Look up a model on behalf of its owner
    pub async fn get_owned(&self, model_id: &str, owner_id: &str) -> ServeResult<ModelMetadata> {
        let metadata = self
            .get(model_id)
            .await
            .ok_or_else(|| ServeError::not_found(model_id))?;
        metadata.ensure_owner(owner_id)?;
        Ok(metadata)
    }

    /// An owner's models, newest first
    pub async fn list(&self, owner_id: &str) -> Vec<ModelMetadata> {
        let mut models: Vec<ModelMetadata> = self
            .models
            .read()
            .await
            .values()
            .filter(|m| m.owner_id == owner_id)
            .cloned()
            .collect();
        models.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        models
    }

    pub async fn update(
        &self,
        model_id: &str,
        owner_id: &str,
        patch: ModelPatch,
    ) -> ServeResult<ModelMetadata> {
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(description) = &patch.description {
            validate_description(description)?;
        }

        let updated = {
            let mut models = self.models.write().await;
            let metadata = models
                .get_mut(model_id)
                .ok_or_else(|| ServeError::not_found(model_id))?;
            metadata.ensure_owner(owner_id)?;

            if let Some(name) = patch.name {
                metadata.name = name.trim().to_string();
            }
            if let Some(description) = patch.description {
                metadata.description = Some(description);
            }
            if let Some(status) = patch.status {
                metadata.status = status;
            }
            metadata.updated_at = Utc::now();
            metadata.clone()
        };
        self.mark_dirty();

        tracing::info!(model_id = %model_id, status = %updated.status, "Model updated");

        let _ = self.event_tx.send(ModelEvent::Updated {
            model_id: model_id.to_string(),
            status: updated.status,
        });

        Ok(updated)
    }

    /// Remove metadata and its artifact, then tell subscribers to evict
    pub async fn delete(&self, model_id: &str, owner_id: &str) -> ServeResult<ModelMetadata> {
        let metadata = self.get_owned(model_id, owner_id).await?;

        if let Some(artifact) = &metadata.artifact {
            self.store.remove(artifact).await?;
        }

        let removed = self
            .models
            .write()
            .await
            .remove(model_id)
            .ok_or_else(|| ServeError::not_found(model_id))?;
        self.mark_dirty();

        tracing::info!(model_id = %model_id, "Model removed from registry");

        let _ = self
            .event_tx
            .send(ModelEvent::Removed(model_id.to_string()));

        Ok(removed)
    }

    /// Count one prediction attempt against a model
    pub async fn increment_usage(&self, model_id: &str) -> ServeResult<()> {
        let mut models = self.models.write().await;
        let metadata = models
            .get_mut(model_id)
            .ok_or_else(|| ServeError::not_found(model_id))?;
        metadata.request_count = metadata.request_count.saturating_add(1);
        metadata.last_used_at = Some(Utc::now());
        self.mark_dirty();
        Ok(())
    }

    pub async fn usage(&self, model_id: &str, owner_id: &str) -> ServeResult<UsageStats> {
        let metadata = self.get_owned(model_id, owner_id).await?;
        Ok(UsageStats {
            model_id: metadata.id,
            status: metadata.status,
            request_count: metadata.request_count,
            last_used_at: metadata.last_used_at,
            created_at: metadata.created_at,
        })
    }

    /// Every record, for persistence
    pub async fn snapshot(&self) -> Vec<ModelMetadata> {
        let mut models: Vec<ModelMetadata> = self.models.read().await.values().cloned().collect();
        models.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        models
    }

    /// Replace contents with persisted records
    pub async fn restore(&self, records: Vec<ModelMetadata>) {
        let mut models = self.models.write().await;
        models.clear();
        for record in records {
            if let Some(artifact) = &record.artifact
                && !self.store.contains(artifact)
            {
                tracing::warn!(
                    model_id = %record.id,
                    path = %artifact.storage_path.display(),
                    "Restored model has no artifact on disk"
                );
            }
            models.insert(record.id.clone(), record);
        }
    }

    pub async fn count(&self) -> usize {
        self.models.read().await.len()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the dirty flag, returning its previous value
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}
