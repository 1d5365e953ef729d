//! API request and response models

use crate::registry::{ModelMetadata, UsageStats};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub models: usize,
    pub resident_models: usize,
}

/// Model information response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    #[serde(flatten)]
    pub metadata: ModelMetadata,
    pub endpoint_url: String,
    pub resident: bool,
}

/// Usage counters plus cache residency
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatsResponse {
    #[serde(flatten)]
    pub usage: UsageStats,
    pub resident: bool,
}

/// Optional body of `POST /models/{model_id}/warmup`
#[derive(Debug, Default, Deserialize)]
pub struct WarmupRequest {
    /// Prediction body run once and discarded
    #[serde(default)]
    pub sample: Option<Value>,
}
