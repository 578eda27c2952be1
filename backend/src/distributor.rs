//! Model distribution
//!
//! Every worker needs the current model formula, and every worker that
//! starts later needs it too. Two protocols are supported:
//!
//! - [`DistributionMode::Slot`] (default): the producer writes a versioned
//!   [`ModelRecord`] into a broker key-value slot. Workers read it without
//!   rewriting it, so concurrent acquisition cannot race.
//! - [`DistributionMode::Republish`]: the model is the single message in a
//!   durable queue. A worker fetches it, republishes an identical copy and
//!   only then acknowledges the original.
//!
//! # Known Anomaly (Republish)
//!
//! Two workers acquiring at the same time can both fetch before either
//! republishes. Depending on interleaving the queue is momentarily empty
//! (a third worker polls again) or holds two identical copies. Both
//! copies carry the same formula, so the duplication is harmless but it
//! is not corrected here.

use crate::broker::{Broker, BrokerError, Persistence, QueueOptions};
use crate::config::PipelineConfig;
use crate::models::ModelRecord;
use crate::resilience::{RetryError, RetryPolicy, Shutdown};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// How workers obtain the current model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionMode {
    #[default]
    Slot,
    Republish,
}

impl std::str::FromStr for DistributionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slot" => Ok(Self::Slot),
            "republish" => Ok(Self::Republish),
            other => Err(format!(
                "unknown model distribution '{}' (expected slot or republish)",
                other
            )),
        }
    }
}

/// Errors raised while acquiring the model
#[derive(Debug, Error)]
pub enum DistributionError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Model payload could not be encoded or decoded: {0}")]
    Codec(String),

    #[error("No model published yet")]
    NotAvailable,
}

/// Publishes and acquires the current model through the broker
#[derive(Clone)]
pub struct ModelDistributor {
    broker: Arc<dyn Broker>,
    queue: String,
    mode: DistributionMode,
    poll_interval: Duration,
}

impl ModelDistributor {
    pub fn new(broker: Arc<dyn Broker>, config: &PipelineConfig) -> Self {
        Self {
            broker,
            queue: config.model_queue.clone(),
            mode: config.model_distribution,
            poll_interval: config.model_poll_interval(),
        }
    }

    pub fn mode(&self) -> DistributionMode {
        self.mode
    }

    pub async fn declare(&self) -> Result<(), BrokerError> {
        self.broker.declare(&self.queue, QueueOptions::durable()).await
    }

    /// Discard any residual model; returns the number of purged messages.
    pub async fn reset(&self) -> Result<usize, BrokerError> {
        self.declare().await?;
        let purged = self.broker.purge(&self.queue).await?;
        self.broker.clear_slot(&self.queue).await?;
        Ok(purged)
    }

    /// Replace the current model.
    ///
    /// The model queue always ends up holding exactly one raw-text copy of
    /// the formula; in slot mode the versioned record is written as well.
    pub async fn publish_model(&self, formula: &str) -> Result<ModelRecord, DistributionError> {
        let purged = self.reset().await?;
        let record = ModelRecord::new(formula);

        if self.mode == DistributionMode::Slot {
            let payload = serde_json::to_vec(&record)
                .map_err(|e| DistributionError::Codec(e.to_string()))?;
            self.broker.write_slot(&self.queue, payload).await?;
        }
        self.broker
            .publish(
                &self.queue,
                record.formula.as_bytes().to_vec(),
                Persistence::Persistent,
            )
            .await?;

        info!(
            queue = %self.queue,
            mode = ?self.mode,
            version = short_version(&record.version),
            purged,
            "Model published"
        );
        Ok(record)
    }

    /// Single acquisition attempt; `None` if no model is published yet.
    pub async fn try_acquire(&self) -> Result<Option<ModelRecord>, DistributionError> {
        match self.mode {
            DistributionMode::Slot => {
                let Some(payload) = self.broker.read_slot(&self.queue).await? else {
                    return Ok(None);
                };
                let record: ModelRecord = serde_json::from_slice(&payload)
                    .map_err(|e| DistributionError::Codec(e.to_string()))?;
                Ok(Some(record))
            }
            DistributionMode::Republish => {
                let Some(delivery) = self.broker.get(&self.queue).await? else {
                    return Ok(None);
                };
                let formula = match String::from_utf8(delivery.payload.clone()) {
                    Ok(formula) => formula,
                    Err(e) => {
                        self.broker.reject(&delivery, true).await?;
                        return Err(DistributionError::Codec(e.to_string()));
                    }
                };

                // Restore availability before releasing our copy
                if let Err(e) = self
                    .broker
                    .publish(&self.queue, delivery.payload.clone(), Persistence::Persistent)
                    .await
                {
                    // A fetched message has no consumer to requeue it for us
                    self.broker.reject(&delivery, true).await?;
                    return Err(e.into());
                }
                self.broker.ack(&delivery).await?;

                Ok(Some(ModelRecord::new(formula)))
            }
        }
    }

    /// Block until a model is available or shutdown fires.
    ///
    /// A lost connection is not retried here; it comes back as
    /// `Exhausted` so the caller can reconnect.
    pub async fn acquire(
        &self,
        shutdown: &Shutdown,
    ) -> Result<ModelRecord, RetryError<DistributionError>> {
        let policy = RetryPolicy::fixed(self.poll_interval);
        let record = policy
            .execute_while(shutdown, "model acquisition", is_retryable, || async {
                self.try_acquire()
                    .await?
                    .ok_or(DistributionError::NotAvailable)
            })
            .await?;

        debug!(
            queue = %self.queue,
            version = short_version(&record.version),
            "Model acquired"
        );
        Ok(record)
    }
}

fn is_retryable(error: &DistributionError) -> bool {
    !matches!(error, DistributionError::Broker(e) if e.is_connection_loss())
}

/// First 12 hex characters, for log lines.
pub fn short_version(version: &str) -> &str {
    &version[..version.len().min(12)]
}
