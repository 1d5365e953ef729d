//! Format adapters: load an artifact, describe its input, run predictions
//!
//! Each supported format has one [`FormatAdapter`] implementation registered
//! in [`BUILTIN_ADAPTERS`]. Everything above this module treats a loaded
//! model as an opaque [`ModelHandle`].

pub mod dense;
pub mod estimator;
mod joblib;
mod onnx;
mod pickle;
pub mod sklearn;
mod tensorflow;
mod torch;

pub use joblib::JoblibAdapter;
pub use onnx::OnnxAdapter;
pub use pickle::PickleAdapter;
pub use tensorflow::TensorflowAdapter;
pub use torch::TorchAdapter;

use crate::container::ExpansionLimits;
use crate::error::ServeError;
use crate::format::ModelFormat;
use crate::input::FeatureMatrix;
use estimator::Estimator;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdapterError {
    /// The artifact could not be turned into a model
    #[error("{0}")]
    Load(String),

    /// The model rejected the input it was given
    #[error("{0}")]
    Prediction(String),
}

impl AdapterError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load(message.into())
    }

    pub fn prediction(message: impl Into<String>) -> Self {
        Self::Prediction(message.into())
    }

    /// Map into the service error taxonomy
    pub fn into_serve_error(self, model_id: &str) -> ServeError {
        match self {
            AdapterError::Load(message) => ServeError::Load {
                model_id: model_id.to_string(),
                message,
            },
            AdapterError::Prediction(message) => ServeError::Prediction { message },
        }
    }
}

/// What a loaded model expects as input
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct InputSchema {
    pub feature_names: Option<Vec<String>>,
    pub n_features: Option<usize>,
}

impl InputSchema {
    pub fn named(names: Vec<String>) -> Self {
        Self {
            n_features: Some(names.len()),
            feature_names: Some(names),
        }
    }

    pub fn width_only(n: usize) -> Self {
        Self {
            feature_names: None,
            n_features: Some(n),
        }
    }

    /// Expected row width, from names when known
    pub fn width(&self) -> Option<usize> {
        self.feature_names
            .as_ref()
            .map(Vec::len)
            .or(self.n_features)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredictionValue {
    Integer(i64),
    Number(f64),
    Label(String),
    /// Multi-output regression row
    Vector(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionOutput {
    pub predictions: Vec<PredictionValue>,
    /// Probability of the predicted class, for classifiers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Vec<f64>>,
}

/// Opaque loaded model, owned by the adapter that created it
pub struct ModelHandle {
    inner: Box<dyn Any + Send + Sync>,
}

impl ModelHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Box::new(value),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}

/// Capability interface implemented once per supported format.
///
/// `load` and `predict` are blocking and are run on the blocking pool by
/// the cache and executor. `predict` takes `&self` and an immutable handle,
/// so concurrent predictions against one handle are allowed.
pub trait FormatAdapter: Send + Sync {
    fn format(&self) -> ModelFormat;

    fn load(&self, path: &Path) -> Result<ModelHandle, AdapterError>;

    fn predict(
        &self,
        handle: &ModelHandle,
        input: &FeatureMatrix,
    ) -> Result<PredictionOutput, AdapterError>;

    fn describe_input_schema(&self, handle: &ModelHandle) -> Option<InputSchema>;

    /// Free adapter-held resources before the cache slot is reused
    fn release(&self, _handle: &ModelHandle) {}
}

/// A lowered estimator plus the schema read from the artifact.
///
/// This is the handle payload of every built-in adapter.
#[derive(Debug, Clone)]
pub struct EstimatorModel {
    pub estimator: Estimator,
    pub feature_names: Option<Vec<String>>,
}

impl EstimatorModel {
    pub fn new(estimator: Estimator, feature_names: Option<Vec<String>>) -> Result<Self, AdapterError> {
        if let (Some(names), Some(n)) = (&feature_names, estimator.n_features())
            && names.len() != n
        {
            return Err(AdapterError::load(format!(
                "artifact names {} features but the model uses {}",
                names.len(),
                n
            )));
        }
        Ok(Self {
            estimator,
            feature_names,
        })
    }

    pub fn into_handle(self) -> ModelHandle {
        ModelHandle::new(self)
    }
}

fn estimator_model(handle: &ModelHandle) -> Result<&EstimatorModel, AdapterError> {
    handle
        .downcast_ref::<EstimatorModel>()
        .ok_or_else(|| AdapterError::prediction("handle was not created by this adapter"))
}

/// `predict` shared by the built-in adapters
pub(crate) fn predict_estimator(
    handle: &ModelHandle,
    input: &FeatureMatrix,
) -> Result<PredictionOutput, AdapterError> {
    estimator_model(handle)?.estimator.predict(input)
}

/// `describe_input_schema` shared by the built-in adapters
pub(crate) fn estimator_schema(handle: &ModelHandle) -> Option<InputSchema> {
    let model = estimator_model(handle).ok()?;
    match (&model.feature_names, model.estimator.n_features()) {
        (Some(names), _) => Some(InputSchema::named(names.clone())),
        (None, Some(n)) => Some(InputSchema::width_only(n)),
        (None, None) => None,
    }
}

pub(crate) fn read_artifact(path: &Path) -> Result<Vec<u8>, AdapterError> {
    std::fs::read(path).map_err(|e| AdapterError::load(format!("cannot read artifact: {}", e)))
}

type AdapterFactory = fn(ExpansionLimits) -> Arc<dyn FormatAdapter>;

/// One adapter per allow-listed format
pub const BUILTIN_ADAPTERS: [(ModelFormat, AdapterFactory); 5] = [
    (ModelFormat::Onnx, |_| Arc::new(OnnxAdapter)),
    (ModelFormat::Tensorflow, |_| Arc::new(TensorflowAdapter)),
    (ModelFormat::Pickle, |limits| Arc::new(PickleAdapter::new(limits))),
    (ModelFormat::Joblib, |limits| Arc::new(JoblibAdapter::new(limits))),
    (ModelFormat::Pytorch, |limits| Arc::new(TorchAdapter::new(limits))),
];

/// Adapter lookup by format
#[derive(Clone)]
pub struct AdapterSet {
    adapters: HashMap<ModelFormat, Arc<dyn FormatAdapter>>,
}

impl AdapterSet {
    pub fn builtin(limits: ExpansionLimits) -> Self {
        Self {
            adapters: BUILTIN_ADAPTERS
                .iter()
                .map(|(format, factory)| (*format, factory(limits)))
                .collect(),
        }
    }

    /// Replace the adapter for one format
    pub fn with_adapter(mut self, adapter: Arc<dyn FormatAdapter>) -> Self {
        self.adapters.insert(adapter.format(), adapter);
        self
    }

    pub fn get(&self, format: ModelFormat) -> Option<Arc<dyn FormatAdapter>> {
        self.adapters.get(&format).cloned()
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSet")
            .field("formats", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
