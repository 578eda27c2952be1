//! In-process pipeline
//!
//! Wires producer, workers and aggregator around one [`MemoryBroker`] in a
//! single runtime. Every component talks to the broker only through the
//! [`Broker`] trait, exactly as it would across processes.

use crate::aggregate::{AggregatorService, Report, ReportSink, Snapshot};
use crate::broker::{connect_with_retry, Broker, Connector, MemoryBroker, MemoryConnector};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::ModelFile;
use crate::producer::{GenerationReport, ScenarioProducer};
use crate::resilience::{shutdown_channel, RetryPolicy, Shutdown};
use crate::scenarios::ScenarioSampler;
use crate::worker::{Worker, WorkerId, WorkerStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub generation: GenerationReport,
    pub workers: Vec<(WorkerId, WorkerStats)>,
    pub report: Report,

    /// Aggregate state at the end of the run
    pub snapshot: Snapshot,
}

impl PipelineOutcome {
    /// Scenarios acknowledged without a result, across all workers
    pub fn dropped(&self) -> u64 {
        self.workers.iter().map(|(_, stats)| stats.dropped).sum()
    }
}

pub struct LocalPipeline {
    config: PipelineConfig,
    workers: usize,
    broker: MemoryBroker,
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl LocalPipeline {
    pub fn new(config: PipelineConfig, workers: usize) -> Self {
        Self {
            config,
            workers: workers.max(1),
            broker: MemoryBroker::new(),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Generate, evaluate and aggregate `model`, returning once every
    /// scenario has been consumed and every result folded in, or once
    /// `shutdown` fires.
    pub async fn run(
        &self,
        model: &ModelFile,
        shutdown: &Shutdown,
    ) -> Result<PipelineOutcome, PipelineError> {
        // Reject bad models before touching any broker state
        model.validate()?;
        ScenarioSampler::new(&model.variables)?;

        let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new(
            self.broker.clone(),
            self.config.broker_host.clone(),
        ));
        let policy = RetryPolicy::fixed(self.config.reconnect_delay());
        let broker = connect_with_retry(connector.as_ref(), &policy, shutdown).await?;

        // Workers must not pick up a previous run's model
        let mut producer = ScenarioProducer::new(Arc::clone(&broker), &self.config);
        producer.reset().await?;

        let (stop, stopping) = shutdown_channel();

        let mut aggregator = AggregatorService::with_connector(Arc::clone(&connector), &self.config);
        for sink in &self.sinks {
            aggregator = aggregator.with_sink(Arc::clone(sink));
        }
        let aggregator_state = Arc::clone(aggregator.aggregator());
        let aggregator_task = tokio::spawn({
            let stopping = stopping.clone();
            async move { aggregator.run(&stopping).await }
        });

        let base_id = WorkerId::from_process();
        let worker_tasks: Vec<_> = (1..=self.workers)
            .map(|n| {
                let id = base_id.with_suffix(n);
                let mut worker = Worker::with_connector(id, Arc::clone(&connector), &self.config);
                let stopping = stopping.clone();
                tokio::spawn(async move {
                    let stats = worker.run(&stopping).await;
                    (worker.id().clone(), stats)
                })
            })
            .collect();

        let generation = match producer.run(model, shutdown).await {
            Ok(generation) => generation,
            Err(e) => {
                stop.trigger();
                for task in worker_tasks {
                    let _ = task.await;
                }
                let _ = aggregator_task.await;
                return Err(e);
            }
        };

        self.wait_for_drain(broker.as_ref(), &worker_tasks, &aggregator_task, shutdown)
            .await;
        stop.trigger();

        let mut workers = Vec::with_capacity(worker_tasks.len());
        for task in worker_tasks {
            let (id, stats) = task.await?;
            workers.push((id, stats?));
        }
        let report = aggregator_task.await??;

        info!(
            run_id = %generation.run_id,
            published = generation.published,
            aggregated = report.kpis.total_processed,
            "Pipeline finished"
        );
        Ok(PipelineOutcome {
            generation,
            workers,
            report,
            snapshot: aggregator_state.snapshot(),
        })
    }

    /// Wait until scenarios and results are fully consumed.
    ///
    /// Scenarios are checked before results: a worker publishes its result
    /// before acknowledging the scenario, so once no scenario is pending
    /// every result is already in the result queue.
    async fn wait_for_drain<T, A>(
        &self,
        broker: &dyn Broker,
        workers: &[JoinHandle<T>],
        aggregator: &JoinHandle<A>,
        shutdown: &Shutdown,
    ) {
        let scenarios = &self.config.scenario_queue;
        let results = &self.config.result_queue;

        loop {
            let scenarios_done = broker.depth(scenarios).await.is_ok_and(|d| d == 0)
                && self.broker.unacked(scenarios) == 0;
            let results_done = broker.depth(results).await.is_ok_and(|d| d == 0)
                && self.broker.unacked(results) == 0;
            if scenarios_done && results_done {
                return;
            }
            if workers.iter().all(|w| w.is_finished()) {
                warn!("All workers stopped before the scenario queue drained");
                return;
            }
            if aggregator.is_finished() {
                warn!("Aggregator stopped before the result queue drained");
                return;
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }
    }
}
