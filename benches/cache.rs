//! Inference cache and request-path benchmarks
//!
//! - Resident hit latency (lease acquire and release)
//! - Full prediction path on a resident model
//! - Safety scan throughput by artifact size

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use model_serve::adapters::{PredictionOutput, PredictionValue};
use model_serve::container::ExpansionLimits;
use model_serve::input::{FeatureMatrix, PredictionInput};
use model_serve::registry::NewModel;
use model_serve::store::ModelArtifact;
use model_serve::{
    AdapterError, AdapterSet, ArtifactSafetyScanner, ArtifactStore, CacheSettings, FormatAdapter,
    InferenceCache, InputSchema, ModelFormat, ModelHandle, ModelRegistry, RiskLevel,
    SafetyAssessment,
};
use serde_json::json;
use std::hint::black_box;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Sums each row
struct SumAdapter;

impl FormatAdapter for SumAdapter {
    fn format(&self) -> ModelFormat {
        ModelFormat::Onnx
    }

    fn load(&self, _path: &Path) -> Result<ModelHandle, AdapterError> {
        Ok(ModelHandle::new(()))
    }

    fn predict(
        &self,
        _handle: &ModelHandle,
        input: &FeatureMatrix,
    ) -> Result<PredictionOutput, AdapterError> {
        Ok(PredictionOutput {
            predictions: input
                .rows()
                .map(|row| PredictionValue::Number(row.iter().sum()))
                .collect(),
            confidence: None,
        })
    }

    fn describe_input_schema(&self, _handle: &ModelHandle) -> Option<InputSchema> {
        Some(InputSchema::named(vec![
            "bedrooms".into(),
            "bathrooms".into(),
            "sqft".into(),
            "age".into(),
        ]))
    }
}

async fn resident_cache(dir: &Path, models: usize) -> Arc<InferenceCache> {
    let store = Arc::new(ArtifactStore::new(dir.to_path_buf()));
    let registry = Arc::new(ModelRegistry::new(store));
    for i in 0..models {
        let id = format!("model-{}", i);
        registry
            .register(NewModel {
                id: id.clone(),
                owner_id: "bench".to_string(),
                name: id.clone(),
                description: None,
                original_filename: "m.onnx".to_string(),
                format: ModelFormat::Onnx,
                artifact: Some(ModelArtifact {
                    checksum: "00".repeat(32),
                    format: ModelFormat::Onnx,
                    size_bytes: 1,
                    storage_path: PathBuf::from(format!("bench/{}/model.onnx", id)),
                }),
                safety: SafetyAssessment {
                    is_valid: true,
                    is_safe: true,
                    risk_level: RiskLevel::Low,
                    findings: vec![],
                },
            })
            .await;
    }

    let cache = InferenceCache::new(
        registry,
        AdapterSet::builtin(ExpansionLimits::default()).with_adapter(Arc::new(SumAdapter)),
        CacheSettings {
            max_resident: models,
            load_timeout: Duration::from_secs(5),
        },
    );
    for i in 0..models {
        cache.preload(&format!("model-{}", i)).await.unwrap();
    }
    cache
}

/// Benchmark lease acquisition on a warm cache
fn bench_cache_hit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    let mut group = c.benchmark_group("cache_hit");

    for models in [1, 8, 64] {
        let cache = rt.block_on(resident_cache(dir.path(), models));
        group.bench_with_input(BenchmarkId::new("resident", models), &cache, |b, cache| {
            b.to_async(&rt).iter(|| async {
                let lease = cache.ensure_loaded("model-0").await.unwrap();
                black_box(lease.model_id().len());
            });
        });
    }
    group.finish();
}

/// Benchmark parse, validate and predict on a resident model
fn bench_predict_path(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    let cache = rt.block_on(resident_cache(dir.path(), 1));
    let mut group = c.benchmark_group("predict_path");

    for rows in [1usize, 32, 256] {
        let row = json!({"bedrooms": 3, "bathrooms": 2, "sqft": 1500, "age": 10});
        let body = json!({"instances": vec![row; rows]});
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("rows", rows), &body, |b, body| {
            b.to_async(&rt).iter(|| async {
                let input = PredictionInput::parse(body).unwrap();
                let lease = cache.ensure_loaded("model-0").await.unwrap();
                let matrix = input.to_matrix(lease.schema()).unwrap();
                black_box(lease.predict(&matrix).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark the static pickle scan by payload size
fn bench_pickle_scan(c: &mut Criterion) {
    let scanner = ArtifactSafetyScanner::new(ExpansionLimits::default()).unwrap();
    let mut group = c.benchmark_group("pickle_scan");

    for floats in [1_000usize, 100_000] {
        // protocol 2 list of floats
        let mut payload = vec![0x80, 2, b']', b'('];
        for i in 0..floats {
            payload.push(b'G');
            payload.extend_from_slice(&(i as f64).to_be_bytes());
        }
        payload.extend_from_slice(b"e.");

        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::new("floats", floats), &payload, |b, payload| {
            b.iter(|| black_box(scanner.assess_format(ModelFormat::Pickle, payload)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cache_hit, bench_predict_path, bench_pickle_scan);
criterion_main!(benches);
