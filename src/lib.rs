//! model-serve - safety-gated model registry and inference server
//!
//! Accepts uploaded machine-learning artifacts, statically assesses whether
//! they are safe to deserialize, registers them per owner, and serves
//! predictions from a bounded cache of loaded models.

pub mod adapters;
pub mod api;
pub mod cache;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod format;
pub mod input;
pub mod metrics;
pub mod pickle;
pub mod proto;
pub mod registry;
pub mod safety;
pub mod state;
pub mod store;
pub mod upload;

pub use adapters::{AdapterError, AdapterSet, FormatAdapter, InputSchema, ModelHandle};
pub use cache::{CacheSettings, CacheStats, InferenceCache, ModelLease};
pub use config::ServeConfig;
pub use error::{ServeError, ServeResult};
pub use executor::{PredictionExecutor, PredictionResult};
pub use format::ModelFormat;
pub use registry::{ModelEvent, ModelMetadata, ModelRegistry, ModelStatus};
pub use safety::{ArtifactSafetyScanner, RiskLevel, SafetyAssessment};
pub use state::StateManager;
pub use store::{ArtifactStore, ModelArtifact};
pub use upload::UploadService;
