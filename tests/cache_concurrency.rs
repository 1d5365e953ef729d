//! Inference cache behaviour under concurrent callers
//!
//! Uses a scripted adapter so load counts, releases and timings are exact.

use model_serve::adapters::{PredictionOutput, PredictionValue};
use model_serve::input::FeatureMatrix;
use model_serve::registry::NewModel;
use model_serve::store::ModelArtifact;
use model_serve::{
    AdapterError, AdapterSet, ArtifactStore, CacheSettings, FormatAdapter, InferenceCache,
    InputSchema, ModelFormat, ModelHandle, ModelRegistry, RiskLevel, SafetyAssessment,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Loads take `delay`; every prediction echoes the row width
struct ScriptedAdapter {
    loads: AtomicUsize,
    releases: AtomicUsize,
    delay: Duration,
}

impl ScriptedAdapter {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            delay,
        })
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl FormatAdapter for ScriptedAdapter {
    fn format(&self) -> ModelFormat {
        ModelFormat::Onnx
    }

    fn load(&self, path: &Path) -> Result<ModelHandle, AdapterError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(ModelHandle::new(path.to_path_buf()))
    }

    fn predict(
        &self,
        _handle: &ModelHandle,
        input: &FeatureMatrix,
    ) -> Result<PredictionOutput, AdapterError> {
        Ok(PredictionOutput {
            predictions: vec![PredictionValue::Number(input.n_cols() as f64); input.n_rows()],
            confidence: None,
        })
    }

    fn describe_input_schema(&self, _handle: &ModelHandle) -> Option<InputSchema> {
        None
    }

    fn release(&self, _handle: &ModelHandle) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    _dir: TempDir,
    registry: Arc<ModelRegistry>,
    cache: Arc<InferenceCache>,
}

async fn harness(adapter: Arc<ScriptedAdapter>, max_resident: usize, ids: &[&str]) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ArtifactStore::new(dir.path().to_path_buf()));
    let registry = Arc::new(ModelRegistry::new(store));
    for id in ids {
        registry
            .register(NewModel {
                id: id.to_string(),
                owner_id: "alice".to_string(),
                name: format!("model {}", id),
                description: None,
                original_filename: "m.onnx".to_string(),
                format: ModelFormat::Onnx,
                artifact: Some(ModelArtifact {
                    checksum: "ab".repeat(32),
                    format: ModelFormat::Onnx,
                    size_bytes: 1,
                    storage_path: PathBuf::from(format!("alice/{}/model.onnx", id)),
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
        registry.clone(),
        AdapterSet::builtin(Default::default()).with_adapter(adapter),
        CacheSettings {
            max_resident,
            load_timeout: Duration::from_secs(10),
        },
    );
    Harness {
        _dir: dir,
        registry,
        cache,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_share_one_load() {
    let adapter = ScriptedAdapter::new(Duration::from_millis(100));
    let h = harness(adapter.clone(), 2, &["m1"]).await;

    let callers: Vec<_> = (0..16)
        .map(|_| {
            let cache = h.cache.clone();
            tokio::spawn(async move { cache.ensure_loaded("m1").await.map(|lease| lease.model_id().to_string()) })
        })
        .collect();

    for caller in futures::future::join_all(callers).await {
        assert_eq!(caller.unwrap().unwrap(), "m1");
    }
    assert_eq!(adapter.loads(), 1);
    assert_eq!(h.cache.stats().size, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lru_evicts_least_recently_used() {
    let adapter = ScriptedAdapter::new(Duration::ZERO);
    let h = harness(adapter.clone(), 2, &["m1", "m2", "m3"]).await;

    drop(h.cache.ensure_loaded("m1").await.unwrap());
    drop(h.cache.ensure_loaded("m2").await.unwrap());
    // m1 becomes the most recently used
    drop(h.cache.ensure_loaded("m1").await.unwrap());

    drop(h.cache.ensure_loaded("m3").await.unwrap());

    assert!(h.cache.is_resident("m1"));
    assert!(!h.cache.is_resident("m2"));
    assert!(h.cache.is_resident("m3"));
    assert_eq!(adapter.loads(), 3);
    let stats = h.cache.stats();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.max_size, 2);

    wait_for(|| adapter.releases() == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_cache_waits_for_in_use_model() {
    let adapter = ScriptedAdapter::new(Duration::ZERO);
    let h = harness(adapter.clone(), 1, &["a", "b"]).await;

    let lease = h.cache.ensure_loaded("a").await.unwrap();

    let cache = h.cache.clone();
    let waiter = tokio::spawn(async move { cache.ensure_loaded("b").await.map(|l| l.model_id().to_string()) });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!waiter.is_finished(), "b must wait while a is in use");
    assert!(h.cache.is_resident("a"));
    assert_eq!(adapter.loads(), 1);

    // the in-use model still answers
    let matrix = FeatureMatrix::from_rows(vec![vec![1.0, 2.0]]).unwrap();
    assert_eq!(
        lease.predict(&matrix).unwrap().predictions,
        vec![PredictionValue::Number(2.0)]
    );
    drop(lease);

    let loaded = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter resumes once the lease is dropped")
        .unwrap()
        .unwrap();
    assert_eq!(loaded, "b");
    assert!(!h.cache.is_resident("a"));
    assert_eq!(adapter.loads(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_eviction_defers_release_until_lease_drops() {
    let adapter = ScriptedAdapter::new(Duration::ZERO);
    let h = harness(adapter.clone(), 2, &["m1"]).await;

    let lease = h.cache.ensure_loaded("m1").await.unwrap();
    assert!(h.cache.evict("m1", "test"));
    assert!(!h.cache.is_resident("m1"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(adapter.releases(), 0);

    drop(lease);
    wait_for(|| adapter.releases() == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removed_model_leaves_cache() {
    let adapter = ScriptedAdapter::new(Duration::ZERO);
    let h = harness(adapter.clone(), 2, &["m1", "m2"]).await;

    drop(h.cache.ensure_loaded("m1").await.unwrap());
    drop(h.cache.ensure_loaded("m2").await.unwrap());

    // the artifact was never written, so only metadata is in the store
    let result = h.registry.delete("m1", "alice").await;
    assert!(result.is_ok(), "{:?}", result.err());

    let cache = h.cache.clone();
    wait_for(move || !cache.is_resident("m1")).await;
    assert!(h.cache.is_resident("m2"));
    wait_for(|| adapter.releases() == 1).await;
}
