//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record an accepted upload
pub fn record_upload(format: &str, safe: bool) {
    metrics::counter!("model_serve_uploads_total",
        "format" => format.to_string(),
        "safe" => safe.to_string()
    )
    .increment(1);
}

/// Record an upload rejected before registration
pub fn record_upload_rejected(code: &'static str) {
    metrics::counter!("model_serve_upload_rejections_total", "code" => code).increment(1);
}

/// Record one prediction attempt; `outcome` is "ok" or an error code
pub fn record_prediction(outcome: &'static str, elapsed: Duration) {
    metrics::counter!("model_serve_predictions_total", "outcome" => outcome).increment(1);
    metrics::histogram!("model_serve_prediction_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_cache_hit() {
    metrics::counter!("model_serve_cache_hits_total").increment(1);
}

/// Record a finished model load
pub fn record_cache_load(format: &str, success: bool, elapsed: Duration) {
    metrics::counter!("model_serve_cache_loads_total",
        "format" => format.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    metrics::histogram!("model_serve_model_load_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_cache_eviction(reason: &'static str) {
    metrics::counter!("model_serve_cache_evictions_total", "reason" => reason).increment(1);
}

/// Update resident model gauge
pub fn update_resident_count(count: usize) {
    metrics::gauge!("model_serve_resident_models").set(count as f64);
}
