//! Monte Carlo Pipeline Core
//!
//! Distributed Monte Carlo evaluation over a message broker: a producer
//! samples scenarios, workers evaluate a model formula per scenario, and a
//! streaming aggregator turns results into live statistics.
//!
//! # Architecture
//!
//! - **broker**: Broker capabilities (queues, acks, prefetch, depth) and an
//!   in-process implementation
//! - **distributor**: How the current model reaches every worker
//! - **producer**: Scenario generation into a bounded queue
//! - **worker**: Single-in-flight evaluation of scenarios
//! - **formula**: Sandboxed formula parser and interpreter
//! - **aggregate**: Moments, reservoir, per-worker counts, reports
//! - **pipeline**: All of the above wired in one process
//! - **rng**: Deterministic random number generation
//!
//! # Critical Invariants
//!
//! 1. The scenario queue never exceeds its bound; overflow drops the oldest
//! 2. A worker never holds more than one unacknowledged scenario
//! 3. Mean and variance are exact over all results; the reservoir is for
//!    display only
//! 4. All randomness is deterministic (seeded RNG)

// Module declarations
pub mod aggregate;
pub mod broker;
pub mod config;
pub mod distributor;
pub mod error;
pub mod formula;
pub mod models;
pub mod pipeline;
pub mod producer;
pub mod resilience;
pub mod rng;
pub mod scenarios;
pub mod worker;

// Re-exports for convenience
pub use aggregate::{Aggregator, AggregatorService, ConsoleDashboard, Report, TracingSink};
pub use broker::{Broker, BrokerError, MemoryBroker};
pub use config::{ConfigError, PipelineConfig};
pub use distributor::{DistributionMode, ModelDistributor};
pub use error::PipelineError;
pub use formula::{Formula, FormulaError};
pub use models::{ModelFile, ModelRecord, ResultMessage, Scenario, VariableSpec};
pub use pipeline::{LocalPipeline, PipelineOutcome};
pub use producer::{GenerationReport, ScenarioProducer};
pub use resilience::{shutdown_channel, RetryPolicy, Shutdown};
pub use rng::RngManager;
pub use scenarios::{SamplingError, ScenarioSampler};
pub use worker::{Outcome, Worker, WorkerId, WorkerStats};
