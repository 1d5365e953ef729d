//! Bounded cache of loaded models with per-model load deduplication
//!
//! Every model id is in one of three states: absent, `Loading` (one shared
//! in-flight load future) or `Resident`. All transitions happen under one
//! short `parking_lot` lock that is never held across an adapter call or an
//! await point. Loads run on their own task so a cancelled request never
//! strands waiters, and a timed-out load still resolves the shared future.
//!
//! Capacity counts loading and resident entries. When a new load needs a
//! slot, the least recently used resident with no in-flight prediction is
//! evicted and released before the new artifact is read. When every
//! resident is busy the caller waits for a lease to be returned.

use crate::adapters::{
    AdapterError, AdapterSet, FormatAdapter, InputSchema, ModelHandle, PredictionOutput,
};
use crate::error::{ServeError, ServeResult};
use crate::format::ModelFormat;
use crate::input::{FeatureMatrix, PredictionInput};
use crate::registry::{ModelEvent, ModelRegistry, ModelStatus};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, broadcast, futures::Notified};

type LoadFuture = Shared<BoxFuture<'static, ServeResult<Arc<ResidentModel>>>>;

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub max_resident: usize,
    pub load_timeout: Duration,
}

/// Point-in-time view of the resident set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub models: Vec<String>,
}

/// What a resident model looks like from outside the cache
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResidentInfo {
    pub model_id: String,
    pub format: ModelFormat,
    pub input_schema: Option<InputSchema>,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupReport {
    #[serde(flatten)]
    pub model: ResidentInfo,
    /// A sample prediction was run
    pub warmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,
}

/// A loaded model owned by the cache
pub struct ResidentModel {
    model_id: String,
    format: ModelFormat,
    adapter: Arc<dyn FormatAdapter>,
    handle: ModelHandle,
    schema: Option<InputSchema>,
    loaded_at: DateTime<Utc>,
    last_access: AtomicU64,
    in_flight: AtomicUsize,
    released: AtomicBool,
}

impl ResidentModel {
    fn info(&self) -> ResidentInfo {
        ResidentInfo {
            model_id: self.model_id.clone(),
            format: self.format,
            input_schema: self.schema.clone(),
            loaded_at: self.loaded_at,
        }
    }

    /// Hand the handle back to its adapter, once
    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.adapter.release(&self.handle);
        }
    }
}

impl Drop for ResidentModel {
    fn drop(&mut self) {
        self.release();
    }
}

enum Entry {
    Loading { load_id: u64, done: LoadFuture },
    Resident(Arc<ResidentModel>),
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    /// Logical time of the last access, for LRU ordering
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Least recently used resident that no prediction is using
    fn idle_victim(&self) -> Option<String> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| match entry {
                Entry::Resident(model) if model.in_flight.load(Ordering::Acquire) == 0 => {
                    Some((model.last_access.load(Ordering::Relaxed), id))
                }
                _ => None,
            })
            .min()
            .map(|(_, id)| id.clone())
    }
}

enum Step<'a> {
    Ready(ModelLease),
    Await(LoadFuture),
    WaitForSlot(Pin<Box<Notified<'a>>>),
}

pub struct InferenceCache {
    state: Mutex<CacheState>,
    /// Signalled whenever a slot may have become available
    slot_freed: Notify,
    registry: Arc<ModelRegistry>,
    adapters: AdapterSet,
    settings: CacheSettings,
    stats: ArcSwap<CacheStats>,
    next_load_id: AtomicU64,
}

impl InferenceCache {
    /// Create the cache and subscribe it to registry events.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        registry: Arc<ModelRegistry>,
        adapters: AdapterSet,
        settings: CacheSettings,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            state: Mutex::new(CacheState::default()),
            slot_freed: Notify::new(),
            registry,
            adapters,
            settings,
            stats: ArcSwap::from_pointee(CacheStats {
                size: 0,
                max_size: settings.max_resident,
                models: Vec::new(),
            }),
            next_load_id: AtomicU64::new(1),
        });

        Self::spawn_event_listener(&cache);

        tracing::info!(
            max_resident = settings.max_resident,
            load_timeout_secs = settings.load_timeout.as_secs(),
            "Inference cache initialized"
        );

        cache
    }

    pub fn max_resident(&self) -> usize {
        self.settings.max_resident
    }

    /// Resident set snapshot; never takes the cache lock
    pub fn stats(&self) -> CacheStats {
        self.stats.load().as_ref().clone()
    }

    pub fn is_resident(&self, model_id: &str) -> bool {
        matches!(
            self.state.lock().entries.get(model_id),
            Some(Entry::Resident(_))
        )
    }

    /// Return a lease on a resident model, loading it first if needed.
    ///
    /// Concurrent callers for a cold model share one load. A failed load is
    /// reported to every waiter and the model goes back to unloaded.
    pub async fn ensure_loaded(self: &Arc<Self>, model_id: &str) -> ServeResult<ModelLease> {
        loop {
            match self.next_step(model_id) {
                Step::Ready(lease) => return Ok(lease),
                Step::Await(done) => {
                    done.await?;
                }
                Step::WaitForSlot(notified) => {
                    tracing::debug!(model_id = %model_id, "Cache full, waiting for a slot");
                    notified.await;
                }
            }
        }
    }

    fn next_step(self: &Arc<Self>, model_id: &str) -> Step<'_> {
        let mut state = self.state.lock();
        let now = state.tick();

        match state.entries.get(model_id) {
            Some(Entry::Resident(model)) => {
                model.last_access.store(now, Ordering::Relaxed);
                model.in_flight.fetch_add(1, Ordering::AcqRel);
                crate::metrics::record_cache_hit();
                return Step::Ready(ModelLease {
                    cache: Arc::clone(self),
                    model: Arc::clone(model),
                });
            }
            Some(Entry::Loading { done, .. }) => return Step::Await(done.clone()),
            None => {}
        }

        let mut victim = None;
        if state.entries.len() >= self.settings.max_resident {
            let Some(victim_id) = state.idle_victim() else {
                // enabled under the lock so a lease returned after this check wakes us
                let mut notified = Box::pin(self.slot_freed.notified());
                notified.as_mut().enable();
                return Step::WaitForSlot(notified);
            };
            if let Some(Entry::Resident(model)) = state.entries.remove(&victim_id) {
                victim = Some(model);
            }
        }

        let load_id = self.next_load_id.fetch_add(1, Ordering::Relaxed);
        let done = self.spawn_load(model_id.to_string(), load_id, victim);
        state.entries.insert(
            model_id.to_string(),
            Entry::Loading {
                load_id,
                done: done.clone(),
            },
        );
        drop(state);

        self.publish_stats();
        Step::Await(done)
    }

    fn spawn_load(
        self: &Arc<Self>,
        model_id: String,
        load_id: u64,
        victim: Option<Arc<ResidentModel>>,
    ) -> LoadFuture {
        let cache = Arc::clone(self);
        let id = model_id.clone();
        let task = tokio::spawn(async move {
            if let Some(victim) = victim {
                cache.release_victim(victim).await;
            }
            let result = cache.load(&id).await;
            cache.finish_load(&id, load_id, &result);
            result
        });

        let cache = Arc::clone(self);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let err = ServeError::internal(format!("model load task failed: {}", e));
                    let result = Err(err.clone());
                    cache.finish_load(&model_id, load_id, &result);
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn release_victim(&self, victim: Arc<ResidentModel>) {
        let model_id = victim.model_id.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || victim.release()).await {
            tracing::warn!(model_id = %model_id, error = %e, "Adapter release failed");
        }
        crate::metrics::record_cache_eviction("capacity");
        tracing::info!(model_id = %model_id, "Evicted least recently used model");
    }

    async fn load(&self, model_id: &str) -> ServeResult<Arc<ResidentModel>> {
        let metadata = self
            .registry
            .get(model_id)
            .await
            .ok_or_else(|| ServeError::not_found(model_id))?;

        if !metadata.safety.is_safe {
            tracing::warn!(model_id = %model_id, "Refusing to load model that failed its safety scan");
            return Err(ServeError::ModelUnsafe {
                model_id: model_id.to_string(),
            });
        }
        if !metadata.is_active() {
            return Err(ServeError::ModelInactive {
                model_id: model_id.to_string(),
                status: metadata.status.to_string(),
            });
        }
        let artifact = metadata.artifact.as_ref().ok_or_else(|| ServeError::ModelUnsafe {
            model_id: model_id.to_string(),
        })?;
        let adapter = self.adapters.get(artifact.format).ok_or_else(|| {
            ServeError::internal(format!("no adapter registered for {}", artifact.format))
        })?;

        let path = self.registry.store().path_of(artifact);
        let format = artifact.format;
        let started = Instant::now();

        let loader = Arc::clone(&adapter);
        let load_path = path.clone();
        let task = tokio::task::spawn_blocking(move || {
            let handle = loader.load(&load_path)?;
            let schema = loader.describe_input_schema(&handle);
            Ok::<_, AdapterError>((handle, schema))
        });

        let (handle, schema) = match tokio::time::timeout(self.settings.load_timeout, task).await {
            Ok(Ok(Ok(loaded))) => loaded,
            Ok(Ok(Err(e))) => {
                crate::metrics::record_cache_load(&format.to_string(), false, started.elapsed());
                tracing::error!(
                    model_id = %model_id,
                    format = %format,
                    path = %path.display(),
                    checksum = %artifact.checksum,
                    error = %e,
                    "Adapter failed to load stored artifact"
                );
                return Err(e.into_serve_error(model_id));
            }
            Ok(Err(e)) => {
                crate::metrics::record_cache_load(&format.to_string(), false, started.elapsed());
                return Err(ServeError::internal(format!("load task panicked: {}", e)));
            }
            Err(_) => {
                crate::metrics::record_cache_load(&format.to_string(), false, started.elapsed());
                tracing::warn!(
                    model_id = %model_id,
                    timeout_secs = self.settings.load_timeout.as_secs(),
                    "Model load timed out"
                );
                return Err(ServeError::Timeout {
                    operation: "model load".to_string(),
                    secs: self.settings.load_timeout.as_secs(),
                });
            }
        };

        let elapsed = started.elapsed();
        crate::metrics::record_cache_load(&format.to_string(), true, elapsed);
        tracing::info!(
            model_id = %model_id,
            format = %format,
            load_ms = elapsed.as_millis() as u64,
            "Model loaded"
        );

        Ok(Arc::new(ResidentModel {
            model_id: model_id.to_string(),
            format,
            adapter,
            handle,
            schema,
            loaded_at: Utc::now(),
            last_access: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }))
    }

    fn finish_load(&self, model_id: &str, load_id: u64, result: &ServeResult<Arc<ResidentModel>>) {
        {
            let mut state = self.state.lock();
            let current = matches!(
                state.entries.get(model_id),
                Some(Entry::Loading { load_id: id, .. }) if *id == load_id
            );
            if current {
                match result {
                    Ok(model) => {
                        let now = state.tick();
                        model.last_access.store(now, Ordering::Relaxed);
                        state
                            .entries
                            .insert(model_id.to_string(), Entry::Resident(Arc::clone(model)));
                    }
                    Err(_) => {
                        state.entries.remove(model_id);
                    }
                }
            }
        }
        self.slot_freed.notify_waiters();
        self.publish_stats();
    }

    /// Drop a model from the cache; in-flight predictions finish on their lease
    pub fn evict(&self, model_id: &str, reason: &'static str) -> bool {
        let removed = self.state.lock().entries.remove(model_id);
        let evicted = match removed {
            Some(Entry::Resident(model)) => {
                // the last reference releases the handle, off the async workers
                tokio::task::spawn_blocking(move || drop(model));
                true
            }
            Some(Entry::Loading { .. }) => true,
            None => false,
        };

        if evicted {
            crate::metrics::record_cache_eviction(reason);
            tracing::info!(model_id = %model_id, reason = reason, "Model evicted");
            self.slot_freed.notify_waiters();
            self.publish_stats();
        }
        evicted
    }

    /// Evict every entry, releasing idle handles immediately
    pub fn clear(&self) {
        let entries: Vec<Entry> = self.state.lock().entries.drain().map(|(_, e)| e).collect();
        for entry in entries {
            if let Entry::Resident(model) = entry
                && model.in_flight.load(Ordering::Acquire) == 0
            {
                model.release();
            }
        }
        self.slot_freed.notify_waiters();
        self.publish_stats();
    }

    /// Load a model ahead of traffic
    pub async fn preload(self: &Arc<Self>, model_id: &str) -> ServeResult<ResidentInfo> {
        let lease = self.ensure_loaded(model_id).await?;
        Ok(lease.info())
    }

    /// Load a model and optionally run one throwaway prediction on a sample
    pub async fn warmup(
        self: &Arc<Self>,
        model_id: &str,
        sample: Option<&PredictionInput>,
    ) -> ServeResult<WarmupReport> {
        let lease = self.ensure_loaded(model_id).await?;
        let info = lease.info();

        let Some(sample) = sample else {
            return Ok(WarmupReport {
                model: info,
                warmed: false,
                processing_time_ms: None,
            });
        };

        let matrix = sample.to_matrix(lease.schema())?;
        let started = Instant::now();
        tokio::task::spawn_blocking(move || lease.predict(&matrix))
            .await
            .map_err(|e| ServeError::internal(format!("warmup task panicked: {}", e)))?
            .map_err(|e| e.into_serve_error(model_id))?;

        let elapsed = started.elapsed();
        tracing::info!(
            model_id = %model_id,
            warmup_ms = elapsed.as_millis() as u64,
            "Model warmed up"
        );

        Ok(WarmupReport {
            model: info,
            warmed: true,
            processing_time_ms: Some(elapsed.as_secs_f64() * 1000.0),
        })
    }

    fn publish_stats(&self) {
        let stats = {
            let state = self.state.lock();
            let mut models: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| matches!(entry, Entry::Resident(_)))
                .map(|(id, _)| id.clone())
                .collect();
            models.sort();
            CacheStats {
                size: models.len(),
                max_size: self.settings.max_resident,
                models,
            }
        };
        crate::metrics::update_resident_count(stats.size);
        self.stats.store(Arc::new(stats));
    }

    /// Evict residents whose registry record is gone or no longer active
    pub async fn reconcile(&self) {
        let resident: Vec<String> = self
            .state
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Resident(_)))
            .map(|(id, _)| id.clone())
            .collect();

        for model_id in resident {
            match self.registry.get(&model_id).await {
                Some(metadata) if metadata.is_active() => {}
                Some(_) => {
                    self.evict(&model_id, "deactivated");
                }
                None => {
                    self.evict(&model_id, "removed");
                }
            }
        }
    }

    fn spawn_event_listener(cache: &Arc<Self>) {
        let mut event_rx = cache.registry.subscribe_events();
        let weak: Weak<Self> = Arc::downgrade(cache);

        tokio::spawn(async move {
            loop {
                let event = event_rx.recv().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                match event {
                    Ok(ModelEvent::Removed(model_id)) => {
                        cache.evict(&model_id, "removed");
                    }
                    Ok(ModelEvent::Updated { model_id, status }) if status != ModelStatus::Active => {
                        cache.evict(&model_id, "deactivated");
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            skipped = skipped,
                            "Inference cache lagged behind model events, reconciling"
                        );
                        cache.reconcile().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Model event channel closed, stopping cache listener");
                        break;
                    }
                }
            }
        });
    }
}

/// Shared use of a resident model.
///
/// While a lease is alive the model cannot be chosen for LRU eviction.
/// Dropping it wakes callers waiting for a slot.
pub struct ModelLease {
    cache: Arc<InferenceCache>,
    model: Arc<ResidentModel>,
}

impl ModelLease {
    pub fn model_id(&self) -> &str {
        &self.model.model_id
    }

    pub fn format(&self) -> ModelFormat {
        self.model.format
    }

    pub fn schema(&self) -> Option<&InputSchema> {
        self.model.schema.as_ref()
    }

    pub fn info(&self) -> ResidentInfo {
        self.model.info()
    }

    /// Blocking; run on the blocking pool
    pub fn predict(&self, input: &FeatureMatrix) -> Result<PredictionOutput, AdapterError> {
        self.model.adapter.predict(&self.model.handle, input)
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        {
            // decrement under the lock so a waiter's capacity check sees it
            let _state = self.cache.state.lock();
            self.model.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        self.cache.slot_freed.notify_waiters();
    }
}
