//! Pipeline configuration
//!
//! `PipelineConfig` carries every tunable of the producer, workers and
//! aggregator. Every field has a default, so an empty file (or no file
//! at all) is valid.
//!
//! Files are read as TOML, JSON or JSON5 depending on extension.
//! `.jsonc` and `.json5` files go through the JSON5 parser, so comments
//! (`//` and `/* */`) and trailing commas are accepted.

use crate::broker::BrokerKind;
use crate::distributor::DistributionMode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration files
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid JSON5: {0}")]
    Json5(#[from] json5::Error),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Unsupported file extension: {0} (expected .json, .jsonc, .json5 or .toml)")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Broker implementation to connect to
    pub broker: BrokerKind,

    /// Broker host. Identity only for the in-process broker.
    pub broker_host: String,

    /// Queue holding the current model formula
    pub model_queue: String,

    /// Bounded queue of sampled scenarios
    pub scenario_queue: String,

    /// Queue of worker results
    pub result_queue: String,

    /// Head-drop bound on the scenario queue
    pub scenario_queue_max_length: usize,

    /// Unacknowledged scenarios a worker may hold (single-in-flight = 1)
    pub worker_prefetch: usize,

    /// Unacknowledged results the aggregator may hold
    pub aggregator_prefetch: usize,

    /// Delay between model acquisition attempts
    pub model_poll_interval_ms: u64,

    /// Delay between broker connection attempts
    pub reconnect_delay_ms: u64,

    /// Period of the aggregator report loop
    pub report_interval_ms: u64,

    /// Log producer progress every N published scenarios
    pub progress_every: u64,

    /// Capacity of the aggregator's display reservoir
    pub reservoir_capacity: usize,

    /// Number of histogram bins over the reservoir
    pub histogram_bins: usize,

    /// Workers shown in the console dashboard ranking
    pub top_workers: usize,

    /// How workers obtain the model
    pub model_distribution: DistributionMode,

    /// RNG seed (None = seeded from wall clock)
    pub seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::default(),
            broker_host: "localhost".to_string(),
            model_queue: "model_queue".to_string(),
            scenario_queue: "scenarios_queue".to_string(),
            result_queue: "results_queue".to_string(),
            scenario_queue_max_length: 2_000_000,
            worker_prefetch: 1,
            aggregator_prefetch: 100,
            model_poll_interval_ms: 2_000,
            reconnect_delay_ms: 5_000,
            report_interval_ms: 1_000,
            progress_every: 10_000,
            reservoir_capacity: 5_000,
            histogram_bins: 50,
            top_workers: 5,
            model_distribution: DistributionMode::default(),
            seed: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML or JSON file and validate it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_structured(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("model_queue", &self.model_queue),
            ("scenario_queue", &self.scenario_queue),
            ("result_queue", &self.result_queue),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", name)));
            }
        }

        let positive = [
            ("scenario_queue_max_length", self.scenario_queue_max_length as u64),
            ("worker_prefetch", self.worker_prefetch as u64),
            ("aggregator_prefetch", self.aggregator_prefetch as u64),
            ("model_poll_interval_ms", self.model_poll_interval_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("report_interval_ms", self.report_interval_ms),
            ("progress_every", self.progress_every),
            ("reservoir_capacity", self.reservoir_capacity as u64),
            ("histogram_bins", self.histogram_bins as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        Ok(())
    }

    pub fn model_poll_interval(&self) -> Duration {
        Duration::from_millis(self.model_poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

/// Read a TOML/JSON/JSON5 file into any deserializable type.
pub(crate) fn read_structured<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match extension.as_str() {
        "json" => Ok(serde_json::from_str(&text)?),
        "jsonc" | "json5" => Ok(json5::from_str(&text)?),
        "toml" => Ok(toml::from_str(&text)?),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}
