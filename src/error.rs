//! Error types for bar ingestion, configuration and the runner registry.

use chrono::{DateTime, Utc};

use crate::types::RunnerKey;

/// A bar the Runner refused to process. Never fatal: the Runner keeps its
/// prior state and waits for the next bar.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BarError {
    #[error("non-finite value in field '{field}'")]
    NonFinite { field: &'static str },

    #[error("negative volume {0}")]
    NegativeVolume(f64),

    #[error("inconsistent range: high {high} / low {low}")]
    InvalidRange { high: f64, low: f64 },

    #[error("timestamp {timestamp} not after last processed bar {last}")]
    OutOfOrder {
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

/// Rejected configuration. Fatal for the Runner being constructed only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be positive (got {value})")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must be within [{min}, {max}] (got {value})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("runner {0} is already running")]
    AlreadyRunning(RunnerKey),

    #[error("runner {0} is not running")]
    NotRunning(RunnerKey),

    #[error("runner {key} rejected its configuration: {source}")]
    InvalidConfig {
        key: RunnerKey,
        #[source]
        source: ConfigError,
    },

    #[error("runner {0} stopped before accepting the bar")]
    Closed(RunnerKey),

    #[error("runner {0} task failed to join")]
    TaskFailed(RunnerKey),
}
