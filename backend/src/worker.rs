//! Evaluation worker
//!
//! A worker acquires the model once, then pulls scenarios one at a time,
//! evaluates the formula and publishes a result.
//!
//! # State Machine
//!
//! ```text
//! AcquiringModel -> Ready -> (Consuming <-> Evaluating <-> Publishing) -> Ready
//! ```
//!
//! # Critical Invariants
//!
//! 1. **Single in flight**: the scenario subscription uses the configured
//!    prefetch (1 by default); the broker quota is the only scheduler
//! 2. **Publish before ack**: a crash between the two redelivers the
//!    scenario, so a result may be counted twice (at-least-once)
//! 3. **Failures are dropped**: a scenario that cannot be evaluated is
//!    acknowledged without a result, logged and counted in
//!    [`WorkerStats::dropped`]
//! 4. **Broker loss is not fatal**: the session is re-established through
//!    the worker's [`Connector`] after `reconnect_delay`; only shutdown
//!    ends [`Worker::run`]. Unacknowledged scenarios of the lost session
//!    are redelivered by the broker.

use crate::broker::{
    connect_with_retry, Broker, BrokerError, Connector, Delivery, Persistence, SharedConnector,
};
use crate::config::PipelineConfig;
use crate::distributor::{short_version, ModelDistributor};
use crate::error::PipelineError;
use crate::formula::{Formula, FormulaError, ParseError};
use crate::models::{ModelRecord, ResultMessage, Scenario};
use crate::producer::declare_data_queues;
use crate::resilience::{RetryError, RetryPolicy, Shutdown};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// ============================================================================
// Identity and state
// ============================================================================

/// Worker identity, stable for the life of the process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkerId(String);

impl WorkerId {
    /// `"{hostname}-{pid}"`
    pub fn from_process() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self(format!("{}-{}", host, std::process::id()))
    }

    /// Distinguish several workers sharing one process.
    pub fn with_suffix(&self, n: usize) -> Self {
        Self(format!("{}-{}", self.0, n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    AcquiringModel,
    Ready,
    Consuming,
    Evaluating,
    Publishing,
}

/// Per-worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Scenarios received
    pub processed: u64,

    /// Results published
    pub published: u64,

    /// Scenarios acknowledged without a result
    pub dropped: u64,
}

/// What happened to one scenario
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Published(f64),
    Dropped(FormulaError),

    /// Payload was not a JSON object of numbers
    Malformed,
}

// ============================================================================
// Worker
// ============================================================================

struct CompiledModel {
    version: String,
    formula: Result<Formula, ParseError>,
}

pub struct Worker {
    id: WorkerId,
    connector: Arc<dyn Connector>,

    /// Broker of the current session, if connected
    broker: Option<Arc<dyn Broker>>,
    config: PipelineConfig,
    model: Option<CompiledModel>,
    state: WorkerState,
    stats: WorkerStats,
}

impl Worker {
    /// Worker bound to an existing broker handle.
    pub fn new(id: WorkerId, broker: Arc<dyn Broker>, config: &PipelineConfig) -> Self {
        let mut worker = Self::with_connector(
            id,
            Arc::new(SharedConnector::new(Arc::clone(&broker))),
            config,
        );
        worker.broker = Some(broker);
        worker
    }

    /// Worker that connects (and reconnects) through `connector`.
    pub fn with_connector(
        id: WorkerId,
        connector: Arc<dyn Connector>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            id,
            connector,
            broker: None,
            config: config.clone(),
            model: None,
            state: WorkerState::AcquiringModel,
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Compile a model; a formula that does not parse is kept as an error
    /// so that every scenario is dropped rather than the worker failing.
    pub fn load_model(&mut self, record: &ModelRecord) {
        let formula = Formula::parse(&record.formula);
        match &formula {
            Ok(_) => info!(
                worker = %self.id,
                version = short_version(&record.version),
                "Model loaded"
            ),
            Err(e) => error!(
                worker = %self.id,
                formula = %record.formula,
                error = %e,
                "Model formula does not parse; every scenario will be dropped"
            ),
        }
        self.model = Some(CompiledModel {
            version: record.version.clone(),
            formula,
        });
        self.state = WorkerState::Ready;
    }

    /// Acquire the model, then consume scenarios until shutdown.
    ///
    /// Broker failures end the current session only; the worker reconnects
    /// and resubscribes, keeping the model it already loaded.
    pub async fn run(&mut self, shutdown: &Shutdown) -> Result<WorkerStats, PipelineError> {
        let policy = RetryPolicy::fixed(self.config.reconnect_delay());

        loop {
            let broker = match self.broker.clone() {
                Some(broker) => broker,
                None => match connect_with_retry(self.connector.as_ref(), &policy, shutdown).await {
                    Ok(broker) => {
                        self.broker = Some(Arc::clone(&broker));
                        broker
                    }
                    Err(RetryError::Cancelled) => break,
                    Err(e) => return Err(e.into()),
                },
            };

            match self.session(&broker, shutdown).await {
                Ok(()) => break,
                Err(e) if e.is_broker_failure() => {
                    self.broker = None;
                    warn!(
                        worker = %self.id,
                        error = %e,
                        delay_ms = self.config.reconnect_delay_ms,
                        "Broker session lost; reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.state = WorkerState::Ready;
        info!(
            worker = %self.id,
            processed = self.stats.processed,
            published = self.stats.published,
            dropped = self.stats.dropped,
            "Worker stopped"
        );
        Ok(self.stats)
    }

    /// One connected session; `Ok` means shutdown was observed.
    async fn session(
        &mut self,
        broker: &Arc<dyn Broker>,
        shutdown: &Shutdown,
    ) -> Result<(), PipelineError> {
        if self.model.is_none() {
            self.state = WorkerState::AcquiringModel;
            info!(worker = %self.id, "Waiting for model");
            let distributor = ModelDistributor::new(Arc::clone(broker), &self.config);
            match distributor.acquire(shutdown).await {
                Ok(record) => self.load_model(&record),
                Err(RetryError::Cancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        declare_data_queues(broker.as_ref(), &self.config).await?;
        let mut consumer = broker
            .consume(&self.config.scenario_queue, self.config.worker_prefetch)
            .await?;

        loop {
            self.state = WorkerState::Consuming;
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                delivery = consumer.recv() => delivery?,
            };
            self.process(&delivery).await?;
            self.state = WorkerState::Ready;
        }
    }

    /// Evaluate one scenario, publish its result if any, and acknowledge it.
    pub async fn process(&mut self, delivery: &Delivery) -> Result<Outcome, PipelineError> {
        let model = self.model.as_ref().ok_or(PipelineError::ModelNotLoaded)?;
        let broker = self
            .broker
            .clone()
            .ok_or_else(|| BrokerError::Connection("worker is not connected".into()))?;
        self.stats.processed += 1;
        self.state = WorkerState::Evaluating;

        let outcome = match serde_json::from_slice::<Scenario>(&delivery.payload) {
            Err(e) => {
                warn!(worker = %self.id, tag = delivery.tag, error = %e, "Malformed scenario dropped");
                Outcome::Malformed
            }
            Ok(scenario) => match evaluate(model, &scenario) {
                Ok(value) => Outcome::Published(value),
                Err(e) => {
                    warn!(worker = %self.id, tag = delivery.tag, error = %e, "Evaluation failed; scenario dropped");
                    Outcome::Dropped(e)
                }
            },
        };

        if let Outcome::Published(value) = outcome {
            self.state = WorkerState::Publishing;
            let payload = serde_json::to_vec(&ResultMessage::new(self.id.as_str(), value))?;
            broker
                .publish(&self.config.result_queue, payload, Persistence::Persistent)
                .await?;
            self.stats.published += 1;
            debug!(worker = %self.id, value, "Result published");
        } else {
            self.stats.dropped += 1;
        }

        broker.ack(delivery).await?;
        Ok(outcome)
    }

    /// Version of the loaded model, if any.
    pub fn model_version(&self) -> Option<&str> {
        self.model.as_ref().map(|m| m.version.as_str())
    }
}

fn evaluate(model: &CompiledModel, scenario: &Scenario) -> Result<f64, FormulaError> {
    match &model.formula {
        Ok(formula) => Ok(formula.evaluate(scenario)?),
        Err(e) => Err(FormulaError::Parse(e.clone())),
    }
}
