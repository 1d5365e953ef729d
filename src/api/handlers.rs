//! API request handlers

use super::identity::{MaybeOwner, Owner};
use super::models::{HealthResponse, ModelInfo, ModelStatsResponse, WarmupRequest};
use super::routes::AppState;
use crate::cache::{CacheStats, ResidentInfo, WarmupReport};
use crate::error::ServeError;
use crate::executor::PredictionResult;
use crate::input::PredictionInput;
use crate::registry::{ModelMetadata, ModelPatch};
use crate::upload::{UploadRequest, UploadResponse, endpoint_url};
use axum::{
    Json,
    body::Bytes,
    extract::{Multipart, Path, State, multipart::Field},
    http::StatusCode,
};
use serde_json::Value;

/// Longest accepted text form field
const MAX_TEXT_FIELD_BYTES: usize = 16 * 1024;

/// GET /health - Service health check
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
            models: state.registry.count().await,
            resident_models: state.cache.stats().size,
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

fn model_info(state: &AppState, metadata: ModelMetadata) -> ModelInfo {
    ModelInfo {
        endpoint_url: endpoint_url(&metadata.id),
        resident: state.cache.is_resident(&metadata.id),
        metadata,
    }
}

/// POST /models - Upload, scan and register a model artifact
pub async fn upload_model(
    State(state): State<AppState>,
    Owner(owner): Owner,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ServeError> {
    let max_bytes = state.limits.max_upload_bytes;
    let timeout = state.limits.upload_timeout;

    // the transfer is cancellable; nothing is written until it completes
    let request = tokio::time::timeout(timeout, read_upload_form(&mut multipart, owner, max_bytes))
        .await
        .map_err(|_| ServeError::Timeout {
            operation: "upload".to_string(),
            secs: timeout.as_secs(),
        })
        .and_then(|read| read)
        .inspect_err(|e| crate::metrics::record_upload_rejected(e.code()))?;

    let (_, response) = state
        .uploads
        .accept(request)
        .await
        .inspect_err(|e| crate::metrics::record_upload_rejected(e.code()))?;

    state.state_manager.persist().await;

    Ok((StatusCode::CREATED, Json(response)))
}

async fn read_upload_form(
    multipart: &mut Multipart,
    owner_id: String,
    max_bytes: usize,
) -> Result<UploadRequest, ServeError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut model_name = None;
    let mut description = None;

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        match field.name() {
            Some("modelFile") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ServeError::validation("modelFile must have a filename"))?;
                let bytes = read_capped(field, max_bytes, "modelFile").await?;
                file = Some((filename, bytes));
            }
            Some("modelName") => {
                model_name = Some(read_text(field, "modelName").await?);
            }
            Some("description") => {
                let text = read_text(field, "description").await?;
                if !text.trim().is_empty() {
                    description = Some(text);
                }
            }
            _ => {
                // unknown fields are drained and ignored
                read_capped(field, max_bytes, "form field").await?;
            }
        }
    }

    let (filename, bytes) = file.ok_or_else(|| ServeError::validation("modelFile is required"))?;
    let model_name = model_name.ok_or_else(|| ServeError::validation("modelName is required"))?;

    Ok(UploadRequest {
        owner_id,
        model_name,
        description,
        filename,
        bytes,
    })
}

fn malformed(e: axum::extract::multipart::MultipartError) -> ServeError {
    ServeError::validation(format!("malformed multipart body: {}", e.body_text()))
}

/// Stream a field chunk by chunk, failing as soon as it passes `max_bytes`
async fn read_capped(mut field: Field<'_>, max_bytes: usize, what: &str) -> Result<Vec<u8>, ServeError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(malformed)? {
        if bytes.len() + chunk.len() > max_bytes {
            return Err(ServeError::validation(format!(
                "{} exceeds the {} byte limit",
                what, max_bytes
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

async fn read_text(field: Field<'_>, what: &str) -> Result<String, ServeError> {
    let bytes = read_capped(field, MAX_TEXT_FIELD_BYTES, what).await?;
    String::from_utf8(bytes).map_err(|_| ServeError::validation(format!("{} must be UTF-8", what)))
}

/// GET /models - List the caller's models
pub async fn list_models(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Json<Vec<ModelInfo>> {
    let models = state.registry.list(&owner).await;
    Json(models.into_iter().map(|m| model_info(&state, m)).collect())
}

/// GET /models/{model_id} - Get model details
pub async fn get_model(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(model_id): Path<String>,
) -> Result<Json<ModelInfo>, ServeError> {
    let metadata = state.registry.get_owned(&model_id, &owner).await?;
    Ok(Json(model_info(&state, metadata)))
}

/// PATCH /models/{model_id} - Update name, description or status
pub async fn update_model(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(model_id): Path<String>,
    body: Bytes,
) -> Result<Json<ModelInfo>, ServeError> {
    let patch: ModelPatch = serde_json::from_slice(&body)
        .map_err(|e| ServeError::validation(format!("invalid update body: {}", e)))?;
    let metadata = state.registry.update(&model_id, &owner, patch).await?;
    state.state_manager.persist().await;
    Ok(Json(model_info(&state, metadata)))
}

/// DELETE /models/{model_id} - Delete a model and its artifact
pub async fn delete_model(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(model_id): Path<String>,
) -> Result<StatusCode, ServeError> {
    state.registry.delete(&model_id, &owner).await?;
    // eviction also arrives through the registry event; this makes it immediate
    state.cache.evict(&model_id, "removed");
    state.state_manager.persist().await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /models/{model_id}/stats - Usage counters
pub async fn model_stats(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(model_id): Path<String>,
) -> Result<Json<ModelStatsResponse>, ServeError> {
    let usage = state.registry.usage(&model_id, &owner).await?;
    Ok(Json(ModelStatsResponse {
        resident: state.cache.is_resident(&model_id),
        usage,
    }))
}

/// POST /models/{model_id}/preload - Load a model ahead of traffic
pub async fn preload_model(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(model_id): Path<String>,
) -> Result<Json<ResidentInfo>, ServeError> {
    state.registry.get_owned(&model_id, &owner).await?;
    let info = state.cache.preload(&model_id).await?;
    Ok(Json(info))
}

/// POST /models/{model_id}/warmup - Load a model and run an optional sample
pub async fn warmup_model(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(model_id): Path<String>,
    body: Bytes,
) -> Result<Json<WarmupReport>, ServeError> {
    state.registry.get_owned(&model_id, &owner).await?;

    let request: WarmupRequest = if body.is_empty() {
        WarmupRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServeError::validation(format!("invalid warmup body: {}", e)))?
    };
    let sample = request
        .sample
        .as_ref()
        .map(PredictionInput::parse)
        .transpose()?;

    let report = state.cache.warmup(&model_id, sample.as_ref()).await?;
    Ok(Json(report))
}

/// POST /predict/{model_id} - Run a prediction
pub async fn predict(
    State(state): State<AppState>,
    MaybeOwner(caller): MaybeOwner,
    Path(model_id): Path<String>,
    body: Bytes,
) -> Result<Json<PredictionResult>, ServeError> {
    let body: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServeError::validation(format!("request body is not valid JSON: {}", e)))?
    };

    let result = state
        .executor
        .predict(&model_id, &body, caller.as_deref())
        .await?;
    Ok(Json(result))
}

/// GET /predict/cache/stats - Resident set snapshot
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}
