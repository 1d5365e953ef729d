//! Model format detection against the fixed allow-list

use crate::error::ServeError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Supported artifact formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    /// ONNX `ModelProto` (protobuf data graph)
    Onnx,
    /// TensorFlow frozen `GraphDef` (protobuf data graph)
    Tensorflow,
    /// Python pickle
    Pickle,
    /// joblib container (pickle with inline numpy buffers, optionally compressed)
    Joblib,
    /// PyTorch zip archive (pickle plus tensor storages)
    Pytorch,
}

impl ModelFormat {
    pub const ALL: [ModelFormat; 5] = [
        ModelFormat::Onnx,
        ModelFormat::Tensorflow,
        ModelFormat::Pickle,
        ModelFormat::Joblib,
        ModelFormat::Pytorch,
    ];

    /// Detect the format from an uploaded filename.
    ///
    /// Only the final extension is considered, case-insensitively.
    pub fn from_filename(filename: &str) -> Result<Self, ServeError> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        Self::from_extension(&extension).ok_or(ServeError::InvalidFormat { extension })
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "onnx" => Some(Self::Onnx),
            "pb" => Some(Self::Tensorflow),
            "pkl" | "pickle" => Some(Self::Pickle),
            "joblib" => Some(Self::Joblib),
            "pt" | "pth" => Some(Self::Pytorch),
            _ => None,
        }
    }

    /// Canonical extension used for stored artifacts
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Onnx => "onnx",
            Self::Tensorflow => "pb",
            Self::Pickle => "pkl",
            Self::Joblib => "joblib",
            Self::Pytorch => "pt",
        }
    }

    /// Whether a naive deserializer for this format can run embedded code
    pub fn can_execute_code(&self) -> bool {
        matches!(self, Self::Pickle | Self::Joblib | Self::Pytorch)
    }
}

impl std::fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Onnx => write!(f, "onnx"),
            Self::Tensorflow => write!(f, "tensorflow"),
            Self::Pickle => write!(f, "pickle"),
            Self::Joblib => write!(f, "joblib"),
            Self::Pytorch => write!(f, "pytorch"),
        }
    }
}
