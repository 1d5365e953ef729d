//! API route definitions

use crate::adapters::AdapterSet;
use crate::cache::{CacheSettings, InferenceCache};
use crate::config::ServeConfig;
use crate::executor::{ExecutorSettings, PredictionExecutor};
use crate::registry::ModelRegistry;
use crate::safety::ArtifactSafetyScanner;
use crate::state::StateManager;
use crate::store::ArtifactStore;
use crate::upload::UploadService;
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Multipart framing and text fields on top of the file itself
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_upload_bytes: usize,
    pub upload_timeout: Duration,
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub cache: Arc<InferenceCache>,
    pub executor: Arc<PredictionExecutor>,
    pub uploads: Arc<UploadService>,
    pub state_manager: Arc<StateManager>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
    pub limits: UploadLimits,
}

impl AppState {
    /// Wire every component from configuration.
    ///
    /// Does not restore persisted state; call `state_manager.restore()`.
    /// Must be called inside a tokio runtime.
    pub fn from_config(
        config: &ServeConfig,
        adapters: AdapterSet,
        prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Result<Self> {
        let store = Arc::new(ArtifactStore::new(config.data_dir.clone()));
        let registry = Arc::new(ModelRegistry::new(store));
        let state_manager = Arc::new(StateManager::new(
            config.state_file.clone(),
            registry.clone(),
        ));

        let scanner = Arc::new(
            ArtifactSafetyScanner::new(config.expansion_limits())
                .context("Failed to build marker scanner")?,
        );
        let uploads = Arc::new(UploadService::new(scanner, registry.clone()));

        let cache = InferenceCache::new(
            registry.clone(),
            adapters,
            CacheSettings {
                max_resident: config.max_resident_models,
                load_timeout: config.load_timeout(),
            },
        );
        let executor = Arc::new(PredictionExecutor::new(
            registry.clone(),
            cache.clone(),
            ExecutorSettings {
                predict_timeout: config.predict_timeout(),
                allow_anonymous: config.allow_anonymous_predictions,
            },
        ));

        Ok(Self {
            registry,
            cache,
            executor,
            uploads,
            state_manager,
            prometheus_handle,
            limits: UploadLimits {
                max_upload_bytes: config.max_upload_bytes,
                upload_timeout: config.upload_timeout(),
            },
        })
    }
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let body_limit = state
        .limits
        .max_upload_bytes
        .saturating_add(FORM_OVERHEAD_BYTES);

    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Model registry
        .route(
            "/models",
            post(handlers::upload_model)
                .layer(DefaultBodyLimit::max(body_limit))
                .get(handlers::list_models),
        )
        .route(
            "/models/{model_id}",
            get(handlers::get_model)
                .patch(handlers::update_model)
                .delete(handlers::delete_model),
        )
        .route("/models/{model_id}/stats", get(handlers::model_stats))
        .route("/models/{model_id}/preload", post(handlers::preload_model))
        .route("/models/{model_id}/warmup", post(handlers::warmup_model))
        // Prediction
        .route("/predict/cache/stats", get(handlers::cache_stats))
        .route("/predict/{model_id}", post(handlers::predict))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
