//! Scenario generator
//!
//! One-shot batch: resets the broker state of any previous run, publishes
//! the model, then samples and publishes `simulation_count` scenarios to
//! the bounded scenario queue.
//!
//! # Critical Invariants
//!
//! 1. **Fail before reset**: distributions are resolved before anything is
//!    purged, so an unknown kind leaves the previous run untouched
//! 2. **No resume**: a run always starts from empty scenario/result queues
//! 3. **Never blocks on a full queue**: overflow is the broker's head-drop

use crate::broker::{Broker, BrokerError, Persistence, QueueOptions};
use crate::config::PipelineConfig;
use crate::distributor::{short_version, ModelDistributor};
use crate::error::PipelineError;
use crate::models::ModelFile;
use crate::resilience::Shutdown;
use crate::rng::RngManager;
use crate::scenarios::ScenarioSampler;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Messages discarded by a reset, per queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub results: usize,
    pub scenarios: usize,
    pub models: usize,
}

/// Outcome of one generation run
#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub run_id: Uuid,
    pub model_version: String,
    pub published: u64,
    pub elapsed: Duration,

    /// Scenarios that would have been evicted had no worker consumed
    /// during generation (upper bound on head-drop losses)
    pub evicted_hint: u64,
}

/// Samples scenarios and feeds the scenario queue
pub struct ScenarioProducer {
    broker: Arc<dyn Broker>,
    distributor: ModelDistributor,
    config: PipelineConfig,
    rng: RngManager,
}

impl ScenarioProducer {
    pub fn new(broker: Arc<dyn Broker>, config: &PipelineConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => RngManager::new(seed),
            None => RngManager::from_entropy(),
        };
        Self {
            distributor: ModelDistributor::new(Arc::clone(&broker), config),
            broker,
            config: config.clone(),
            rng,
        }
    }

    /// Declare the scenario and result queues plus the model queue.
    pub async fn declare_queues(&self) -> Result<(), BrokerError> {
        declare_data_queues(self.broker.as_ref(), &self.config).await?;
        self.distributor.declare().await
    }

    /// Discard every trace of a previous run.
    pub async fn reset(&self) -> Result<ResetSummary, BrokerError> {
        self.declare_queues().await?;
        let summary = ResetSummary {
            results: self.broker.purge(&self.config.result_queue).await?,
            scenarios: self.broker.purge(&self.config.scenario_queue).await?,
            models: self.distributor.reset().await?,
        };
        info!(
            results = summary.results,
            scenarios = summary.scenarios,
            models = summary.models,
            "Previous run state purged"
        );
        Ok(summary)
    }

    /// Generate and publish every scenario of `model`.
    ///
    /// Stops early (with [`PipelineError::Cancelled`]) if `shutdown` fires.
    pub async fn run(
        &mut self,
        model: &ModelFile,
        shutdown: &Shutdown,
    ) -> Result<GenerationReport, PipelineError> {
        model.validate()?;
        let sampler = ScenarioSampler::new(&model.variables)?;
        let run_id = Uuid::new_v4();

        self.reset().await?;
        let record = self.distributor.publish_model(&model.model_function).await?;

        info!(
            %run_id,
            scenarios = model.simulation_count,
            variables = model.variables.len(),
            version = short_version(&record.version),
            "Generating scenarios"
        );

        let start = Instant::now();
        let mut published = 0u64;
        while published < model.simulation_count {
            if shutdown.is_triggered() {
                warn!(%run_id, published, "Generation interrupted");
                return Err(PipelineError::Cancelled);
            }

            let scenario = sampler.sample(&mut self.rng);
            let payload = serde_json::to_vec(&scenario)?;
            self.broker
                .publish(&self.config.scenario_queue, payload, Persistence::Persistent)
                .await?;
            published += 1;

            if published % self.config.progress_every == 0 {
                info!(published, total = model.simulation_count, "Generation progress");
            }
        }

        let elapsed = start.elapsed();
        let evicted_hint =
            published.saturating_sub(self.config.scenario_queue_max_length as u64);
        if evicted_hint > 0 {
            warn!(
                evicted_hint,
                max_length = self.config.scenario_queue_max_length,
                "Scenario count exceeds queue bound; unconsumed scenarios may be evicted"
            );
        }
        info!(
            %run_id,
            published,
            elapsed_secs = elapsed.as_secs_f64(),
            "Generation complete"
        );

        Ok(GenerationReport {
            run_id,
            model_version: record.version,
            published,
            elapsed,
            evicted_hint,
        })
    }
}

/// Declare the scenario (bounded) and result queues.
///
/// Every component declares what it touches, with identical options, so
/// start order does not matter.
pub async fn declare_data_queues(
    broker: &dyn Broker,
    config: &PipelineConfig,
) -> Result<(), BrokerError> {
    broker
        .declare(
            &config.scenario_queue,
            QueueOptions::bounded(config.scenario_queue_max_length),
        )
        .await?;
    broker
        .declare(&config.result_queue, QueueOptions::durable())
        .await
}
