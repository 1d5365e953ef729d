use super::{
    AdapterError, FormatAdapter, InputSchema, ModelHandle, PredictionOutput, estimator_schema,
    predict_estimator, read_artifact, sklearn,
};
use crate::container::{ExpansionLimits, joblib_payload};
use crate::format::ModelFormat;
use crate::input::FeatureMatrix;
use crate::pickle::{Flavor, unpickle};
use std::path::Path;

/// joblib dumps, optionally zlib or gzip compressed
#[derive(Debug, Clone, Copy)]
pub struct JoblibAdapter {
    limits: ExpansionLimits,
}

impl JoblibAdapter {
    pub fn new(limits: ExpansionLimits) -> Self {
        Self { limits }
    }
}

/// Unwrap, unpickle and lower a scikit-learn estimator.
///
/// `joblib.dump` output is commonly saved under `.pkl`, so plain pickles go
/// through here too: the joblib dialect only differs once a
/// `NumpyArrayWrapper` is built, and an uncompressed stream passes the
/// container sniff unchanged.
pub(super) fn load_estimator(
    path: &Path,
    limits: ExpansionLimits,
    label: &str,
) -> Result<ModelHandle, AdapterError> {
    let bytes = read_artifact(path)?;
    let payload = joblib_payload(&bytes, limits)
        .map_err(|e| AdapterError::load(format!("{} container: {}", label, e)))?;
    let unpickled = unpickle(&payload, Flavor::Joblib)
        .map_err(|e| AdapterError::load(format!("{} stream: {}", label, e)))?;
    let model = sklearn::lower(&unpickled.heap, unpickled.root)?;
    tracing::debug!(
        path = %path.display(),
        protocol = unpickled.protocol,
        compressed = payload.len() != bytes.len(),
        features = ?model.estimator.n_features(),
        "Lowered {} estimator",
        label
    );
    Ok(model.into_handle())
}

impl FormatAdapter for JoblibAdapter {
    fn format(&self) -> ModelFormat {
        ModelFormat::Joblib
    }

    fn load(&self, path: &Path) -> Result<ModelHandle, AdapterError> {
        load_estimator(path, self.limits, "joblib")
    }

    fn predict(
        &self,
        handle: &ModelHandle,
        input: &FeatureMatrix,
    ) -> Result<PredictionOutput, AdapterError> {
        predict_estimator(handle, input)
    }

    fn describe_input_schema(&self, handle: &ModelHandle) -> Option<InputSchema> {
        estimator_schema(handle)
    }
}
