//! Configuration structures and loading logic

use crate::container::ExpansionLimits;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServeConfig {
    pub api_port: u16,
    /// Root of the artifact store
    pub data_dir: PathBuf,
    pub state_file: PathBuf,
    pub max_resident_models: usize,
    pub max_upload_bytes: usize,
    pub upload_timeout_secs: u64,
    pub predict_timeout_secs: u64,
    pub load_timeout_secs: u64,
    pub allow_anonymous_predictions: bool,
    pub usage_flush_interval_secs: u64,

    /// Ceiling on the inflated size of compressed containers
    #[serde(default = "default_max_decompressed_bytes")]
    pub max_decompressed_bytes: u64,

    /// Ceiling on inflated size as a multiple of the compressed size
    #[serde(default = "default_max_decompression_ratio")]
    pub max_decompression_ratio: u64,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            data_dir: default_data_dir(),
            state_file: default_state_file(),
            max_resident_models: default_max_resident_models(),
            max_upload_bytes: default_max_upload_bytes(),
            upload_timeout_secs: default_upload_timeout(),
            predict_timeout_secs: default_predict_timeout(),
            load_timeout_secs: default_load_timeout(),
            allow_anonymous_predictions: true,
            usage_flush_interval_secs: default_usage_flush_interval(),
            max_decompressed_bytes: default_max_decompressed_bytes(),
            max_decompression_ratio: default_max_decompression_ratio(),
        }
    }
}

impl ServeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("MODEL_SERVE_API_PORT") {
            config.api_port = port.parse().context("Invalid MODEL_SERVE_API_PORT value")?;
        }
        if let Ok(data_dir) = std::env::var("MODEL_SERVE_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(state_file) = std::env::var("MODEL_SERVE_STATE_FILE") {
            config.state_file = PathBuf::from(state_file);
        }
        if let Ok(max) = std::env::var("MODEL_SERVE_MAX_RESIDENT_MODELS") {
            config.max_resident_models = max
                .parse()
                .context("Invalid MODEL_SERVE_MAX_RESIDENT_MODELS value")?;
        }
        if let Ok(max) = std::env::var("MODEL_SERVE_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = max
                .parse()
                .context("Invalid MODEL_SERVE_MAX_UPLOAD_BYTES value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Port range validation
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.max_resident_models == 0 {
            anyhow::bail!("max_resident_models must be at least 1");
        }
        if self.max_upload_bytes == 0 {
            anyhow::bail!("max_upload_bytes must be greater than zero");
        }
        for (name, secs) in [
            ("upload_timeout_secs", self.upload_timeout_secs),
            ("predict_timeout_secs", self.predict_timeout_secs),
            ("load_timeout_secs", self.load_timeout_secs),
            ("usage_flush_interval_secs", self.usage_flush_interval_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if self.max_decompression_ratio == 0 {
            anyhow::bail!("max_decompression_ratio must be greater than zero");
        }
        if self.max_decompressed_bytes < self.max_upload_bytes as u64 {
            anyhow::bail!(
                "max_decompressed_bytes ({}) must be at least max_upload_bytes ({})",
                self.max_decompressed_bytes,
                self.max_upload_bytes
            );
        }

        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Cannot create data directory: {:?}", self.data_dir))?;

        // Ensure state file directory exists or can be created
        if let Some(parent) = self.state_file.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create state file directory: {:?}", parent))?;
        }

        Ok(())
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn predict_timeout(&self) -> Duration {
        Duration::from_secs(self.predict_timeout_secs)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn usage_flush_interval(&self) -> Duration {
        Duration::from_secs(self.usage_flush_interval_secs)
    }

    pub fn expansion_limits(&self) -> ExpansionLimits {
        ExpansionLimits {
            max_bytes: self.max_decompressed_bytes,
            max_ratio: self.max_decompression_ratio,
        }
    }
}

// Default functions
fn default_api_port() -> u16 {
    9000
}
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("model-serve")
        .join("models")
}
fn default_state_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("model-serve")
        .join("state.toml")
}
fn default_max_resident_models() -> usize {
    8
}
fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}
fn default_upload_timeout() -> u64 {
    120
}
fn default_predict_timeout() -> u64 {
    30
}
fn default_load_timeout() -> u64 {
    60
}
fn default_usage_flush_interval() -> u64 {
    10
}
fn default_max_decompressed_bytes() -> u64 {
    1024 * 1024 * 1024
}
fn default_max_decompression_ratio() -> u64 {
    200
}
