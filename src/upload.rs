//! Upload intake: scan, store and register a candidate artifact

use crate::error::{ServeError, ServeResult};
use crate::format::ModelFormat;
use crate::registry::{ModelMetadata, ModelRegistry, NewModel, validate_description, validate_name};
use crate::safety::{ArtifactSafetyScanner, Finding, RiskLevel};
use crate::store::ArtifactStore;
use serde::Serialize;
use std::sync::Arc;

/// A fully received upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub owner_id: String,
    pub model_name: String,
    pub description: Option<String>,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub original_name: String,
    pub size: u64,
    pub format: ModelFormat,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub is_safe: bool,
    pub risk_level: RiskLevel,
    pub recommendations: Vec<String>,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub model_id: String,
    pub endpoint_url: String,
    pub status: UploadStatus,
    pub file_info: FileInfo,
    pub validation_result: ValidationResult,
}

pub fn endpoint_url(model_id: &str) -> String {
    format!("/predict/{}", model_id)
}

pub struct UploadService {
    scanner: Arc<ArtifactSafetyScanner>,
    registry: Arc<ModelRegistry>,
}

impl UploadService {
    pub fn new(scanner: Arc<ArtifactSafetyScanner>, registry: Arc<ModelRegistry>) -> Self {
        Self { scanner, registry }
    }

    fn store(&self) -> &ArtifactStore {
        self.registry.store()
    }

    /// Check the form fields before any scanning happens
    pub fn validate_fields(request: &UploadRequest) -> ServeResult<()> {
        validate_name(&request.model_name)?;
        if let Some(description) = &request.description {
            validate_description(description)?;
        }
        if request.filename.trim().is_empty() {
            return Err(ServeError::validation("modelFile must have a filename"));
        }
        if request.bytes.is_empty() {
            return Err(ServeError::validation("modelFile is empty"));
        }
        Ok(())
    }

    /// Accept an upload.
    ///
    /// Safe artifacts are stored and registered active. Everything else,
    /// including files that do not parse as their declared format, is
    /// registered without stored bytes so the owner can see the assessment;
    /// such models can never be loaded. Unparseable files report
    /// `status: error`.
    pub async fn accept(&self, request: UploadRequest) -> ServeResult<(ModelMetadata, UploadResponse)> {
        Self::validate_fields(&request)?;

        // fails fast on an extension outside the allow-list
        let format = ModelFormat::from_filename(&request.filename)?;

        let scanner = Arc::clone(&self.scanner);
        let UploadRequest {
            owner_id,
            model_name,
            description,
            filename,
            bytes,
        } = request;
        let scan_name = filename.clone();
        let (report, bytes) = tokio::task::spawn_blocking(move || {
            let report = scanner.assess(&scan_name, &bytes);
            (report, bytes)
        })
        .await
        .map_err(|e| ServeError::internal(format!("safety scan panicked: {}", e)))?;
        let assessment = report?.assessment;

        let model_id = uuid::Uuid::new_v4().to_string();

        let (artifact, checksum) = if assessment.is_safe {
            let artifact = self.store().store(&owner_id, &model_id, format, &bytes).await?;
            let checksum = artifact.checksum.clone();
            (Some(artifact), checksum)
        } else {
            tracing::warn!(
                model_id = %model_id,
                owner = %owner_id,
                filename = %filename,
                valid = assessment.is_valid,
                findings = assessment.findings.len(),
                "Unsafe artifact quarantined, bytes discarded"
            );
            (None, hex::encode(<sha2::Sha256 as sha2::Digest>::digest(&bytes)))
        };

        let recommendations = assessment.recommendations(format);
        let metadata = self
            .registry
            .register(NewModel {
                id: model_id.clone(),
                owner_id,
                name: model_name,
                description,
                original_filename: filename.clone(),
                format,
                artifact,
                safety: assessment.clone(),
            })
            .await;

        crate::metrics::record_upload(&format.to_string(), assessment.is_safe);

        let status = if assessment.is_valid {
            UploadStatus::Success
        } else {
            UploadStatus::Error
        };
        let response = UploadResponse {
            endpoint_url: endpoint_url(&model_id),
            model_id,
            status,
            file_info: FileInfo {
                original_name: filename,
                size: bytes.len() as u64,
                format,
                checksum,
            },
            validation_result: ValidationResult {
                is_valid: assessment.is_valid,
                is_safe: assessment.is_safe,
                risk_level: assessment.risk_level,
                recommendations,
                findings: assessment.findings,
            },
        };

        Ok((metadata, response))
    }
}
