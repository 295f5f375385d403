//! Pipeline configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::exchanges::{BackoffConfig, StreamConfig};
use crate::metrics::MetricsConfig;
use crate::sinks::SinksConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete pipeline configuration. Every section falls back to its defaults
/// when absent from the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stream: StreamConfig,
    pub backoff: BackoffConfig,
    pub metrics: MetricsConfig,
    pub sinks: SinksConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.stream.symbols.is_empty() {
            return invalid("no symbols provided");
        }
        if self.stream.symbols.iter().any(|s| s.trim().is_empty()) {
            return invalid("symbols must not contain blank entries");
        }
        if self.stream.channels.is_empty() {
            return invalid("no channels provided");
        }
        if self.stream.channels.iter().any(|c| c.trim().is_empty()) {
            return invalid("channels must not contain blank entries");
        }
        if let Err(e) = Url::parse(&self.stream.url) {
            return Err(ConfigError::Invalid(format!(
                "invalid url {}: {}",
                self.stream.url, e
            )));
        }
        if self.stream.inbound_queue_depth == 0 {
            return invalid("stream.inbound_queue_depth must be positive");
        }
        let st = &self.stream;
        if st.keepalive_interval_ms == 0
            || st.keepalive_timeout_ms == 0
            || st.connect_timeout_ms == 0
            || st.close_timeout_ms == 0
        {
            return invalid("stream keep-alive and timeout settings must be positive");
        }

        let b = &self.backoff;
        if b.base_ms == 0 || b.max_ms < b.base_ms {
            return invalid("backoff requires 0 < base_ms <= max_ms");
        }
        if !(b.jitter_min.is_finite() && b.jitter_max.is_finite())
            || b.jitter_min <= 0.0
            || b.jitter_max < b.jitter_min
        {
            return invalid("backoff jitter range must satisfy 0 < jitter_min <= jitter_max");
        }

        let m = &self.metrics;
        if m.window_ms == 0 {
            return invalid("metrics.window_ms must be positive");
        }
        if m.snapshot_interval_ms == 0 || m.csv_export_interval_ms == 0 {
            return invalid("metrics intervals must be positive");
        }

        let s = &self.sinks;
        if s.jsonl_flush_count == 0 || s.jsonl_flush_interval_ms == 0 {
            return invalid("jsonl flush thresholds must be positive");
        }
        Ok(())
    }
}

/// Split a comma separated list, dropping blanks.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
