//! Error types for the serving core and API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the upload, registry, cache and prediction paths.
///
/// Every variant maps to a stable machine-readable code and an HTTP status.
/// The type is `Clone` so a single load failure can be handed to every
/// caller that was waiting on the same in-flight load.
#[derive(Debug, Clone, Error)]
pub enum ServeError {
    #[error("{message}")]
    Validation { message: String },

    #[error("{message}")]
    MissingInput { message: String },

    #[error("unsupported model format '{extension}'")]
    InvalidFormat { extension: String },

    #[error("model '{model_id}' not found")]
    ModelNotFound { model_id: String },

    #[error("model '{model_id}' is {status} and cannot serve predictions")]
    ModelInactive { model_id: String, status: String },

    #[error("model '{model_id}' failed its safety assessment and will not be loaded")]
    ModelUnsafe { model_id: String },

    #[error("{message}")]
    Forbidden { message: String },

    #[error("failed to load model '{model_id}': {message}")]
    Load { model_id: String, message: String },

    #[error("{message}")]
    Prediction { message: String },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("internal error: {message}")]
    Internal { message: String },
}

pub type ServeResult<T> = Result<T, ServeError>;

impl ServeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(model_id: impl Into<String>) -> Self {
        Self::ModelNotFound {
            model_id: model_id.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::MissingInput { .. } => "MISSING_INPUT_DATA",
            Self::InvalidFormat { .. } => "INVALID_FORMAT",
            Self::ModelNotFound { .. } => "MODEL_NOT_FOUND",
            Self::ModelInactive { .. } => "MODEL_INACTIVE",
            Self::ModelUnsafe { .. } => "MODEL_UNSAFE",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Load { .. } => "LOAD_FAILED",
            Self::Prediction { .. } => "PREDICTION_FAILED",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. }
            | Self::MissingInput { .. }
            | Self::InvalidFormat { .. }
            | Self::Prediction { .. } => StatusCode::BAD_REQUEST,
            Self::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ModelInactive { .. } | Self::ModelUnsafe { .. } | Self::Forbidden { .. } => {
                StatusCode::FORBIDDEN
            }
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Load { .. } | Self::Storage { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to hand to a client.
    ///
    /// Server-side failures are logged with full context and replaced by a
    /// generic sentence; client-side failures pass through verbatim.
    fn public_message(&self) -> String {
        match self {
            Self::Load { model_id, .. } => {
                format!("model '{}' could not be loaded", model_id)
            }
            Self::Storage { .. } => "artifact storage failed".to_string(),
            Self::Internal { .. } => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request rejected");
        }

        let body = Json(ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.public_message(),
                timestamp: chrono::Utc::now(),
            },
        });

        (status, body).into_response()
    }
}

impl From<std::io::Error> for ServeError {
    fn from(err: std::io::Error) -> Self {
        ServeError::storage(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}
