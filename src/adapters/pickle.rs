use super::joblib::load_estimator;
use super::{
    AdapterError, FormatAdapter, InputSchema, ModelHandle, PredictionOutput, estimator_schema,
    predict_estimator,
};
use crate::container::ExpansionLimits;
use crate::format::ModelFormat;
use crate::input::FeatureMatrix;
use std::path::Path;

/// Pickled scikit-learn estimators, including `joblib.dump` output saved as `.pkl`
#[derive(Debug, Clone, Copy)]
pub struct PickleAdapter {
    limits: ExpansionLimits,
}

impl PickleAdapter {
    pub fn new(limits: ExpansionLimits) -> Self {
        Self { limits }
    }
}

impl FormatAdapter for PickleAdapter {
    fn format(&self) -> ModelFormat {
        ModelFormat::Pickle
    }

    fn load(&self, path: &Path) -> Result<ModelHandle, AdapterError> {
        load_estimator(path, self.limits, "pickle")
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
