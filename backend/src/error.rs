//! Crate-wide error type for pipeline entry points

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::distributor::DistributionError;
use crate::resilience::RetryError;
use crate::scenarios::SamplingError;
use thiserror::Error;

/// Errors that end a producer, worker or aggregator run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error("Model distribution error: {0}")]
    Distribution(#[from] DistributionError),

    #[error("Message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("No model loaded")]
    ModelNotLoaded,

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Cancelled by shutdown")]
    Cancelled,
}

impl PipelineError {
    /// Raised by the broker rather than by the model or the data; a new
    /// session may succeed.
    pub fn is_broker_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::Broker(_) | PipelineError::Distribution(DistributionError::Broker(_))
        )
    }
}

impl From<RetryError<BrokerError>> for PipelineError {
    fn from(error: RetryError<BrokerError>) -> Self {
        match error {
            RetryError::Exhausted { last, .. } => PipelineError::Broker(last),
            RetryError::Cancelled => PipelineError::Cancelled,
        }
    }
}

impl From<RetryError<DistributionError>> for PipelineError {
    fn from(error: RetryError<DistributionError>) -> Self {
        match error {
            RetryError::Exhausted { last, .. } => PipelineError::Distribution(last),
            RetryError::Cancelled => PipelineError::Cancelled,
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(error: tokio::task::JoinError) -> Self {
        PipelineError::Task(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_failures_are_recognised() {
        assert!(PipelineError::Broker(BrokerError::Closed).is_broker_failure());
        assert!(
            PipelineError::Distribution(DistributionError::Broker(BrokerError::Connection(
                "reset".into()
            )))
            .is_broker_failure()
        );
        assert!(!PipelineError::Distribution(DistributionError::NotAvailable).is_broker_failure());
        assert!(!PipelineError::ModelNotLoaded.is_broker_failure());
    }
}
