//! Static safety assessment of uploaded artifacts
//!
//! Nothing in this module executes or deserializes an artifact for real.
//! Pickle-family formats are walked by the symbolic pickle machine, data-graph
//! formats are decoded as protobuf and inspected. Any critical finding makes
//! the artifact unsafe.

mod graph;
pub mod markers;
mod pickle;

pub use pickle::{GlobalClass, classify};

use crate::container::{self, ExpansionLimits, TorchArchive};
use crate::error::ServeError;
use crate::format::ModelFormat;
use crate::pickle::Flavor;
use markers::MarkerScanner;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl Finding {
    pub fn new(severity: Severity, code: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Outcome of a static scan, computed once at upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyAssessment {
    /// The artifact parsed as its declared format
    pub is_valid: bool,
    pub is_safe: bool,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl SafetyAssessment {
    fn from_findings(format: ModelFormat, is_valid: bool, findings: Vec<Finding>) -> Self {
        let mut risk_level = baseline_risk(format);
        let worst = findings.iter().map(|f| f.severity).max();
        let is_safe = is_valid && worst != Some(Severity::Critical);
        match worst {
            Some(Severity::Critical) => risk_level = RiskLevel::High,
            Some(Severity::Warning) => risk_level = risk_level.max(RiskLevel::Medium),
            _ => {}
        }
        if !is_valid {
            risk_level = RiskLevel::High;
        }
        Self {
            is_valid,
            is_safe,
            risk_level,
            findings,
        }
    }

    /// Human-readable advice, one sentence per distinct finding code
    pub fn recommendations(&self, format: ModelFormat) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out: Vec<String> = self
            .findings
            .iter()
            .filter(|f| seen.insert(f.code.as_str()))
            .filter_map(|f| recommendation_for(&f.code).map(str::to_string))
            .collect();
        if format.can_execute_code() {
            out.push(
                "This format can execute code when loaded; consider exporting the model to ONNX."
                    .to_string(),
            );
        }
        out
    }
}

fn recommendation_for(code: &str) -> Option<&'static str> {
    let text = match code {
        "DANGEROUS_GLOBAL" => {
            "The artifact references process, filesystem or code-loading primitives; re-export it from a trusted environment."
        }
        "UNKNOWN_GLOBAL" => {
            "The artifact references classes outside the recognised ML libraries; verify its provenance."
        }
        "UNRESOLVABLE_REFERENCE" => {
            "Re-save the model without pickle extension registries or out-of-band buffers."
        }
        "EXECUTION_MARKER" => {
            "Raw bytes contain process-execution markers; do not load this file outside a sandbox."
        }
        "MALFORMED_ARTIFACT" => "The file does not parse as its declared format; re-export the model.",
        "DECOMPRESSION_LIMIT" => {
            "The compressed payload expands beyond the allowed size; save the model uncompressed."
        }
        "UNSUPPORTED_COMPRESSION" => "Save joblib files uncompressed or with zlib/gzip compression.",
        "TORCHSCRIPT_CODE" => {
            "The archive contains TorchScript code; upload a plain state dict instead."
        }
        "EXTERNAL_DATA_ESCAPE" => {
            "External tensor data points outside the model directory; embed all weights in the file."
        }
        "EXTERNAL_DATA" => "Embed external tensor data in the model file before uploading.",
        "CUSTOM_OPERATOR_DOMAIN" => "Custom operator domains may not be supported at inference time.",
        "DANGEROUS_OP" => "Remove Python and filesystem ops from the graph before freezing it.",
        _ => return None,
    };
    Some(text)
}

/// Starting risk before any finding is considered
pub fn baseline_risk(format: ModelFormat) -> RiskLevel {
    if format.can_execute_code() {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Findings collector with optional de-duplication by key
#[derive(Debug, Default)]
pub(crate) struct FindingSink {
    findings: Vec<Finding>,
    keys: HashSet<String>,
}

impl FindingSink {
    pub(crate) fn push(&mut self, finding: Finding) {
        self.findings.push(finding);
    }

    pub(crate) fn push_unique(&mut self, key: String, finding: Finding) {
        if self.keys.insert(key) {
            self.findings.push(finding);
        }
    }

    pub(crate) fn into_findings(self) -> Vec<Finding> {
        self.findings
    }
}

/// Result of [`ArtifactSafetyScanner::assess`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssessmentReport {
    pub declared_format: ModelFormat,
    pub assessment: SafetyAssessment,
}

/// Static risk assessment for candidate artifacts
#[derive(Debug, Clone)]
pub struct ArtifactSafetyScanner {
    markers: MarkerScanner,
    limits: ExpansionLimits,
}

impl ArtifactSafetyScanner {
    pub fn new(limits: ExpansionLimits) -> Result<Self, aho_corasick::BuildError> {
        Ok(Self {
            markers: MarkerScanner::new()?,
            limits,
        })
    }

    /// Detect the declared format and scan the bytes.
    ///
    /// Fails only for extensions outside the allow-list; every other problem
    /// is reported as findings.
    pub fn assess(&self, filename: &str, bytes: &[u8]) -> Result<AssessmentReport, ServeError> {
        let declared_format = ModelFormat::from_filename(filename)?;
        let assessment = self.assess_format(declared_format, bytes);

        if assessment.is_safe {
            info!(
                filename = %filename,
                format = %declared_format,
                risk = %assessment.risk_level,
                findings = assessment.findings.len(),
                "Artifact passed safety scan"
            );
        } else {
            warn!(
                filename = %filename,
                format = %declared_format,
                valid = assessment.is_valid,
                findings = assessment.findings.len(),
                "Artifact failed safety scan"
            );
        }

        Ok(AssessmentReport {
            declared_format,
            assessment,
        })
    }

    pub fn assess_format(&self, format: ModelFormat, bytes: &[u8]) -> SafetyAssessment {
        let mut sink = FindingSink::default();

        let is_valid = if bytes.is_empty() {
            sink.push(Finding::new(
                Severity::Critical,
                "MALFORMED_ARTIFACT",
                "artifact is empty",
            ));
            false
        } else {
            match format {
                ModelFormat::Onnx => graph::analyze_onnx(bytes, &mut sink),
                ModelFormat::Tensorflow => graph::analyze_tensorflow(bytes, &mut sink),
                ModelFormat::Pickle => self.scan_pickle_family(bytes, "pickle", &mut sink),
                ModelFormat::Joblib => self.scan_pickle_family(bytes, "joblib", &mut sink),
                ModelFormat::Pytorch => self.scan_pytorch(bytes, &mut sink),
            }
        };

        let findings = sink.into_findings();
        debug!(format = %format, findings = ?findings, "Scan complete");
        SafetyAssessment::from_findings(format, is_valid, findings)
    }

    fn scan_markers(&self, bytes: &[u8], label: &str, sink: &mut FindingSink) {
        for hit in self.markers.scan(bytes) {
            sink.push_unique(
                format!("marker:{}", hit.marker),
                Finding::new(
                    Severity::Critical,
                    "EXECUTION_MARKER",
                    format!(
                        "{}: process-execution marker {:?} at byte {}",
                        label, hit.marker, hit.offset
                    ),
                ),
            );
        }
    }

    /// Pickle and joblib share one path: `joblib.dump` output is routinely
    /// saved as `.pkl`, and a plain pickle passes the compression sniff as is.
    fn scan_pickle_family(&self, bytes: &[u8], label: &str, sink: &mut FindingSink) -> bool {
        self.scan_markers(bytes, label, sink);
        let payload = match container::joblib_payload(bytes, self.limits) {
            Ok(payload) => payload,
            Err(container::ContainerError::LimitExceeded { limit }) => {
                sink.push(Finding::new(
                    Severity::Critical,
                    "DECOMPRESSION_LIMIT",
                    format!("{} payload expands beyond {} bytes", label, limit),
                ));
                return true;
            }
            Err(container::ContainerError::UnsupportedCompression(kind)) => {
                sink.push(Finding::new(
                    Severity::Critical,
                    "UNSUPPORTED_COMPRESSION",
                    format!("{} payload uses {} compression, which cannot be inspected", label, kind),
                ));
                return false;
            }
            Err(e) => {
                sink.push(Finding::new(
                    Severity::Critical,
                    "MALFORMED_ARTIFACT",
                    format!("{} container is corrupt: {}", label, e),
                ));
                return false;
            }
        };
        if payload.len() != bytes.len() {
            self.scan_markers(&payload, &format!("{} (decompressed)", label), sink);
        }
        pickle::analyze_stream(&payload, Flavor::Joblib, label, sink)
    }

    fn scan_pytorch(&self, bytes: &[u8], sink: &mut FindingSink) -> bool {
        self.scan_markers(bytes, "archive", sink);
        let archive = match TorchArchive::open(bytes, self.limits) {
            Ok(archive) => archive,
            Err(container::ContainerError::LimitExceeded { limit }) => {
                sink.push(Finding::new(
                    Severity::Critical,
                    "DECOMPRESSION_LIMIT",
                    format!("archive expands beyond {} bytes", limit),
                ));
                return true;
            }
            Err(e) => {
                sink.push(Finding::new(
                    Severity::Critical,
                    "MALFORMED_ARTIFACT",
                    format!("PyTorch artifact is not a readable zip archive: {}", e),
                ));
                return false;
            }
        };

        if archive.data_pickle().is_err() {
            sink.push(Finding::new(
                Severity::Critical,
                "MALFORMED_ARTIFACT",
                "PyTorch archive has no data.pkl",
            ));
            return false;
        }
        if archive.has_code() {
            sink.push(Finding::new(
                Severity::Warning,
                "TORCHSCRIPT_CODE",
                "archive contains TorchScript code entries, which are ignored",
            ));
        }

        for (name, data) in archive.entries() {
            self.scan_markers(data, name, sink);
        }
        let mut valid = true;
        for (name, data) in archive.pickles() {
            valid &= pickle::analyze_stream(data, Flavor::Plain, name, sink);
        }
        valid
    }
}
