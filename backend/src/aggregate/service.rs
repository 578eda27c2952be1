//! Aggregator loops: result consumption and periodic reporting
//!
//! The consumer survives broker failures: it drops the session, waits
//! `reconnect_delay` and reconnects through its [`Connector`]. While
//! disconnected the reporter keeps running and shows queue depths as
//! unavailable.

use super::report::{QueueDepth, Report, ReportSink};
use super::Aggregator;
use crate::broker::{connect_with_retry, Broker, Connector, QueueOptions, SharedConnector};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::ResultMessage;
use crate::resilience::{RetryError, RetryPolicy, Shutdown};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Runs the consumption and report loops around one [`Aggregator`]
#[derive(Clone)]
pub struct AggregatorService {
    aggregator: Arc<Aggregator>,
    connector: Arc<dyn Connector>,

    /// Broker of the current session, shared with the reporter
    session: Arc<Mutex<Option<Arc<dyn Broker>>>>,
    config: PipelineConfig,
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl AggregatorService {
    /// Service bound to an existing broker handle.
    pub fn new(broker: Arc<dyn Broker>, config: &PipelineConfig) -> Self {
        let service = Self::with_connector(
            Arc::new(SharedConnector::new(Arc::clone(&broker))),
            config,
        );
        *service.session.lock() = Some(broker);
        service
    }

    /// Service that connects (and reconnects) through `connector`.
    pub fn with_connector(connector: Arc<dyn Connector>, config: &PipelineConfig) -> Self {
        Self {
            aggregator: Arc::new(Aggregator::from_config(config)),
            connector,
            session: Arc::new(Mutex::new(None)),
            config: config.clone(),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    fn current_broker(&self) -> Option<Arc<dyn Broker>> {
        self.session.lock().clone()
    }

    /// Consume results until shutdown; returns how many were folded in.
    ///
    /// Broker failures are logged and followed by a reconnect; only
    /// shutdown ends the loop.
    pub async fn run_consumer(&self, shutdown: &Shutdown) -> Result<u64, PipelineError> {
        let policy = RetryPolicy::fixed(self.config.reconnect_delay());
        let mut consumed = 0u64;

        loop {
            let broker = match self.current_broker() {
                Some(broker) => broker,
                None => match connect_with_retry(self.connector.as_ref(), &policy, shutdown).await {
                    Ok(broker) => {
                        *self.session.lock() = Some(Arc::clone(&broker));
                        broker
                    }
                    Err(RetryError::Cancelled) => break,
                    Err(e) => return Err(e.into()),
                },
            };

            match self.consume_session(broker.as_ref(), shutdown, &mut consumed).await {
                Ok(()) => break,
                Err(e) if e.is_broker_failure() => {
                    self.session.lock().take();
                    warn!(
                        error = %e,
                        delay_ms = self.config.reconnect_delay_ms,
                        "Result consumer lost the broker; reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        debug!(consumed, "Result consumer stopped");
        Ok(consumed)
    }

    /// One connected session; `Ok` means shutdown was observed.
    async fn consume_session(
        &self,
        broker: &dyn Broker,
        shutdown: &Shutdown,
        consumed: &mut u64,
    ) -> Result<(), PipelineError> {
        broker
            .declare(&self.config.result_queue, QueueOptions::durable())
            .await?;
        let mut consumer = broker
            .consume(&self.config.result_queue, self.config.aggregator_prefetch)
            .await?;
        info!(
            queue = %self.config.result_queue,
            prefetch = self.config.aggregator_prefetch,
            "Consuming results"
        );

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                delivery = consumer.recv() => delivery?,
            };

            match serde_json::from_slice::<ResultMessage>(&delivery.payload) {
                Ok(result) if result.value.is_finite() => {
                    self.aggregator.update(&result);
                    broker.ack(&delivery).await?;
                    *consumed += 1;
                }
                Ok(_) => {
                    warn!(tag = delivery.tag, "Non-finite result rejected");
                    broker.reject(&delivery, false).await?;
                }
                Err(e) => {
                    warn!(tag = delivery.tag, error = %e, "Malformed result rejected");
                    broker.reject(&delivery, false).await?;
                }
            }
        }
    }

    /// Best-effort depth query.
    async fn depth(&self, queue: &str) -> QueueDepth {
        let Some(broker) = self.current_broker() else {
            return QueueDepth::Unavailable;
        };
        match broker.depth(queue).await {
            Ok(depth) => QueueDepth::Available(depth),
            Err(e) => {
                debug!(queue, error = %e, "Queue depth unavailable");
                QueueDepth::Unavailable
            }
        }
    }

    /// Snapshot the state, then query queue depths outside the lock.
    pub async fn build_report(&self) -> Report {
        let snapshot = self.aggregator.snapshot();
        let pending = self.depth(&self.config.scenario_queue).await;
        let queued = self.depth(&self.config.result_queue).await;
        snapshot.report(pending, queued, self.config.histogram_bins)
    }

    fn deliver(&self, report: &Report) {
        for sink in &self.sinks {
            sink.deliver(report);
        }
    }

    /// Deliver a report every `report_interval` until shutdown, then one
    /// final report, which is returned.
    pub async fn run_reporter(&self, shutdown: &Shutdown) -> Report {
        let mut ticker = tokio::time::interval(self.config.report_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.build_report().await;
                    self.deliver(&report);
                }
            }
        }

        let report = self.build_report().await;
        self.deliver(&report);
        report
    }

    /// Both loops side by side; returns the final report.
    ///
    /// A non-broker consumer error stops the reporter as well.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<Report, PipelineError> {
        let reporter = async { Ok::<_, PipelineError>(self.run_reporter(shutdown).await) };
        let (consumed, report) = tokio::try_join!(self.run_consumer(shutdown), reporter)?;
        info!(consumed, total = report.kpis.total_processed, "Aggregator stopped");
        Ok(report)
    }
}
