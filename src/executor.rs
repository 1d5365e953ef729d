//! Prediction requests: resolve, authorize, load, validate, predict, record

use crate::adapters::{PredictionOutput, PredictionValue};
use crate::cache::InferenceCache;
use crate::error::{ServeError, ServeResult};
use crate::input::PredictionInput;
use crate::registry::ModelRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionResult {
    pub model_id: String,
    pub predictions: Vec<PredictionValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Vec<f64>>,
    pub processing_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub predict_timeout: Duration,
    /// Accept predictions without a caller identity
    pub allow_anonymous: bool,
}

pub struct PredictionExecutor {
    registry: Arc<ModelRegistry>,
    cache: Arc<InferenceCache>,
    settings: ExecutorSettings,
}

impl PredictionExecutor {
    pub fn new(
        registry: Arc<ModelRegistry>,
        cache: Arc<InferenceCache>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            registry,
            cache,
            settings,
        }
    }

    /// Run one prediction request end to end.
    ///
    /// Usage is counted once per attempt that reaches an authorized,
    /// existing model, whatever the outcome.
    pub async fn predict(
        &self,
        model_id: &str,
        body: &Value,
        caller: Option<&str>,
    ) -> ServeResult<PredictionResult> {
        let started = Instant::now();

        let metadata = match self.registry.get(model_id).await {
            Some(metadata) => metadata,
            None => {
                let err = ServeError::not_found(model_id);
                crate::metrics::record_prediction(err.code(), started.elapsed());
                return Err(err);
            }
        };

        let authorized = match caller {
            Some(owner) => metadata.ensure_owner(owner),
            None if self.settings.allow_anonymous => Ok(()),
            None => Err(ServeError::Forbidden {
                message: "predictions require a caller identity".to_string(),
            }),
        };
        if let Err(err) = authorized {
            crate::metrics::record_prediction(err.code(), started.elapsed());
            return Err(err);
        }

        let result = if metadata.is_active() {
            self.run(model_id, body).await
        } else {
            Err(ServeError::ModelInactive {
                model_id: model_id.to_string(),
                status: metadata.status.to_string(),
            })
        };

        if let Err(e) = self.registry.increment_usage(model_id).await {
            tracing::warn!(model_id = %model_id, error = %e, "Failed to record model usage");
        }

        let elapsed = started.elapsed();
        match result {
            Ok(output) => {
                crate::metrics::record_prediction("ok", elapsed);
                tracing::debug!(
                    model_id = %model_id,
                    rows = output.predictions.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Prediction served"
                );
                Ok(PredictionResult {
                    model_id: model_id.to_string(),
                    predictions: output.predictions,
                    confidence: output.confidence,
                    processing_time_ms: elapsed.as_secs_f64() * 1000.0,
                    timestamp: Utc::now(),
                })
            }
            Err(err) => {
                crate::metrics::record_prediction(err.code(), elapsed);
                Err(err)
            }
        }
    }

    async fn run(&self, model_id: &str, body: &Value) -> ServeResult<PredictionOutput> {
        let input = PredictionInput::parse(body)?;
        let timeout = self.settings.predict_timeout;

        let work = async {
            let lease = self.cache.ensure_loaded(model_id).await?;
            let matrix = input.to_matrix(lease.schema())?;
            // the lease moves into the blocking task and is returned when it ends
            tokio::task::spawn_blocking(move || lease.predict(&matrix))
                .await
                .map_err(|e| ServeError::internal(format!("prediction task panicked: {}", e)))?
                .map_err(|e| e.into_serve_error(model_id))
        };

        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| ServeError::Timeout {
                operation: "prediction".to_string(),
                secs: timeout.as_secs(),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterError, AdapterSet, FormatAdapter, InputSchema, ModelHandle};
    use crate::cache::CacheSettings;
    use crate::format::ModelFormat;
    use crate::input::FeatureMatrix;
    use crate::registry::{ModelPatch, ModelStatus, NewModel};
    use crate::safety::{RiskLevel, SafetyAssessment};
    use crate::store::{ArtifactStore, ModelArtifact};
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Echoes the first column; rejects rows that start with a negative value
    struct EchoAdapter {
        loads: AtomicUsize,
    }

    impl FormatAdapter for EchoAdapter {
        fn format(&self) -> ModelFormat {
            ModelFormat::Onnx
        }

        fn load(&self, _path: &Path) -> Result<ModelHandle, AdapterError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(ModelHandle::new(()))
        }

        fn predict(
            &self,
            _handle: &ModelHandle,
            input: &FeatureMatrix,
        ) -> Result<PredictionOutput, AdapterError> {
            input
                .rows()
                .map(|row| match row[0] {
                    v if v < 0.0 => Err(AdapterError::prediction("negative input")),
                    v => Ok(PredictionValue::Number(v)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(|predictions| PredictionOutput {
                    predictions,
                    confidence: None,
                })
        }

        fn describe_input_schema(&self, _handle: &ModelHandle) -> Option<InputSchema> {
            Some(InputSchema::width_only(1))
        }
    }

    struct Fixture {
        _dir: TempDir,
        registry: Arc<ModelRegistry>,
        cache: Arc<InferenceCache>,
        adapter: Arc<EchoAdapter>,
        executor: PredictionExecutor,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path().to_path_buf()));
        let registry = Arc::new(ModelRegistry::new(store));
        let adapter = Arc::new(EchoAdapter {
            loads: AtomicUsize::new(0),
        });
        let cache = InferenceCache::new(
            registry.clone(),
            AdapterSet::builtin(Default::default()).with_adapter(adapter.clone()),
            CacheSettings {
                max_resident: 2,
                load_timeout: Duration::from_secs(5),
            },
        );
        let executor = PredictionExecutor::new(
            registry.clone(),
            cache.clone(),
            ExecutorSettings {
                predict_timeout: Duration::from_secs(5),
                allow_anonymous: true,
            },
        );
        registry
            .register(NewModel {
                id: "m1".to_string(),
                owner_id: "alice".to_string(),
                name: "echo".to_string(),
                description: None,
                original_filename: "m.onnx".to_string(),
                format: ModelFormat::Onnx,
                artifact: Some(ModelArtifact {
                    checksum: "00".repeat(32),
                    format: ModelFormat::Onnx,
                    size_bytes: 1,
                    storage_path: PathBuf::from("alice/m1/model.onnx"),
                }),
                safety: SafetyAssessment {
                    is_valid: true,
                    is_safe: true,
                    risk_level: RiskLevel::Low,
                    findings: vec![],
                },
            })
            .await;
        Fixture {
            _dir: dir,
            registry,
            cache,
            adapter,
            executor,
        }
    }

    async fn request_count(f: &Fixture) -> u64 {
        f.registry.usage("m1", "alice").await.unwrap().request_count
    }

    #[tokio::test]
    async fn test_success_counts_usage() {
        let f = fixture().await;
        let result = f.executor.predict("m1", &json!([[2.5]]), Some("alice")).await.unwrap();
        assert_eq!(result.predictions, vec![PredictionValue::Number(2.5)]);
        assert_eq!(request_count(&f).await, 1);
        assert!(f.registry.get("m1").await.unwrap().last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_inactive_model_is_never_loaded() {
        let f = fixture().await;
        f.registry
            .update(
                "m1",
                "alice",
                ModelPatch {
                    status: Some(ModelStatus::Inactive),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = f.executor.predict("m1", &json!([[1.0]]), Some("alice")).await.unwrap_err();
        assert_eq!(err.code(), "MODEL_INACTIVE");
        assert_eq!(f.adapter.loads.load(Ordering::SeqCst), 0);
        assert_eq!(f.cache.stats().size, 0);
        // the attempt still counts
        assert_eq!(request_count(&f).await, 1);
    }

    #[tokio::test]
    async fn test_failed_attempts_count_usage() {
        let f = fixture().await;

        let err = f.executor.predict("m1", &json!({}), Some("alice")).await.unwrap_err();
        assert_eq!(err.code(), "MISSING_INPUT_DATA");
        assert_eq!(request_count(&f).await, 1);

        let err = f.executor.predict("m1", &json!([[-1.0]]), Some("alice")).await.unwrap_err();
        assert_eq!(err.code(), "PREDICTION_FAILED");
        assert_eq!(request_count(&f).await, 2);

        let err = f.executor.predict("m1", &json!([[1.0, 2.0]]), Some("alice")).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(request_count(&f).await, 3);
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_callers_are_not_counted() {
        let f = fixture().await;

        let err = f.executor.predict("nope", &json!([[1.0]]), Some("alice")).await.unwrap_err();
        assert_eq!(err.code(), "MODEL_NOT_FOUND");

        let err = f.executor.predict("m1", &json!([[1.0]]), Some("mallory")).await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        assert_eq!(request_count(&f).await, 0);
        assert_eq!(f.adapter.loads.load(Ordering::SeqCst), 0);
    }
}
