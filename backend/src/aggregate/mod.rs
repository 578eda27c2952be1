//! Streaming aggregator
//!
//! Consumes results continuously and reports live statistics on a timer.
//!
//! # Critical Invariants
//!
//! 1. **One critical section**: [`Aggregator::update`] and
//!    [`Aggregator::snapshot`] are the only ways in; both hold the same lock,
//!    so a snapshot's count, moments, reservoir and worker counts always
//!    describe the same instant
//! 2. **Exact moments**: mean and variance come from all-time sums, never
//!    from the reservoir
//! 3. **Bounded memory**: the reservoir holds at most `reservoir_capacity`
//!    values; percentiles and the histogram are computed from it alone

pub mod report;
pub mod service;
pub mod state;
pub mod stats;

pub use report::{ConsoleDashboard, Kpis, QueueDepth, Report, ReportSink, TracingSink};
pub use service::AggregatorService;
pub use state::{AggregateState, MomentAccumulator, Reservoir};
pub use stats::{percentile, rank_workers, Histogram, HistogramBin, Statistics, WorkerCount};

use crate::config::PipelineConfig;
use crate::models::ResultMessage;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Consistent copy of the aggregate state
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub moments: MomentAccumulator,
    pub reservoir: Vec<f64>,
    pub per_worker: HashMap<String, u64>,
}

impl Snapshot {
    pub fn statistics(&self) -> Statistics {
        Statistics::compute(&self.moments, &self.reservoir)
    }

    /// Assemble a report from this snapshot and the queue depths.
    pub fn report(
        &self,
        pending_scenarios: QueueDepth,
        queued_results: QueueDepth,
        histogram_bins: usize,
    ) -> Report {
        let statistics = self.statistics();
        Report {
            kpis: Kpis {
                pending_scenarios,
                queued_results,
                total_processed: statistics.count,
                mean: statistics.mean,
                std_dev: statistics.std_dev,
            },
            statistics,
            histogram: Histogram::build(&self.reservoir, histogram_bins),
            workers: rank_workers(&self.per_worker),
        }
    }
}

/// Owner of the single aggregate state
#[derive(Debug)]
pub struct Aggregator {
    state: Mutex<AggregateState>,
}

impl Aggregator {
    pub fn new(reservoir_capacity: usize) -> Self {
        Self {
            state: Mutex::new(AggregateState::new(reservoir_capacity)),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.reservoir_capacity)
    }

    /// Fold one result into the state.
    pub fn update(&self, result: &ResultMessage) {
        self.state.lock().record(&result.worker_id, result.value);
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            moments: state.moments,
            reservoir: state.reservoir.to_vec(),
            per_worker: state.per_worker.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_is_consistent_under_concurrent_updates() {
        let aggregator = Arc::new(Aggregator::new(100));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    let worker = format!("w-{}", t);
                    for i in 0..1000 {
                        aggregator.update(&ResultMessage::new(worker.as_str(), i as f64));
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            let snapshot = aggregator.snapshot();
            let per_worker: u64 = snapshot.per_worker.values().sum();
            assert_eq!(per_worker, snapshot.moments.count);
            assert!(snapshot.reservoir.len() as u64 <= snapshot.moments.count.min(100));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.moments.count, 4000);
        assert_eq!(snapshot.reservoir.len(), 100);
    }

    #[test]
    fn test_report_from_empty_snapshot() {
        let report = Aggregator::new(10).snapshot().report(
            QueueDepth::Unavailable,
            QueueDepth::Available(0),
            50,
        );
        assert_eq!(report.kpis.total_processed, 0);
        assert!(report.kpis.mean.is_none());
        assert!(report.histogram.bins.is_empty());
        assert!(report.workers.is_empty());
    }
}
