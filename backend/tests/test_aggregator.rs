//! Streaming aggregation: exact moments, bounded reservoir, reports

use montecarlo_core::aggregate::{
    Aggregator, AggregatorService, MomentAccumulator, QueueDepth, Report, ReportSink, Reservoir,
};
use montecarlo_core::broker::{Broker, MemoryBroker, Persistence, QueueOptions};
use montecarlo_core::models::ResultMessage;
use montecarlo_core::resilience::shutdown_channel;
use montecarlo_core::PipelineConfig;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Properties
// ============================================================================

fn direct_moments(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance)
}

proptest! {
    #[test]
    fn moments_match_direct_formula(values in prop::collection::vec(-1.0e3f64..1.0e3, 1..500)) {
        let mut moments = MomentAccumulator::default();
        for v in &values {
            moments.add(*v);
        }
        let (mean, variance) = direct_moments(&values);
        let scale = 1.0 + values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64;

        prop_assert_eq!(moments.count, values.len() as u64);
        prop_assert!((moments.mean().unwrap() - mean).abs() <= 1e-9 * (1.0 + mean.abs()));
        prop_assert!((moments.variance().unwrap() - variance).abs() <= 1e-9 * scale);
    }

    #[test]
    fn variance_is_never_negative(
        base in -1.0e9f64..1.0e9,
        jitter in prop::collection::vec(-1.0e-6f64..1.0e-6, 1..200),
    ) {
        // Large offset, tiny spread: worst case for sum-of-squares cancellation
        let mut moments = MomentAccumulator::default();
        for j in &jitter {
            moments.add(base + j);
            prop_assert!(moments.variance().unwrap() >= 0.0);
            prop_assert!(moments.std_dev().unwrap().is_finite());
        }
    }

    #[test]
    fn reservoir_holds_most_recent_in_order(
        capacity in 1usize..100,
        values in prop::collection::vec(any::<i32>(), 0..400),
    ) {
        let mut reservoir = Reservoir::new(capacity);
        for v in &values {
            reservoir.push(*v as f64);
            prop_assert!(reservoir.len() <= capacity);
        }
        let keep = values.len().min(capacity);
        let expected: Vec<f64> = values[values.len() - keep..].iter().map(|v| *v as f64).collect();
        prop_assert_eq!(reservoir.to_vec(), expected);
    }
}

#[test]
fn test_default_reservoir_capacity() {
    let aggregator = Aggregator::from_config(&PipelineConfig::default());
    for i in 0..6000 {
        aggregator.update(&ResultMessage::new("w", i as f64));
    }
    let snapshot = aggregator.snapshot();
    assert_eq!(snapshot.reservoir.len(), 5000);
    assert_eq!(snapshot.reservoir[0], 1000.0);
    assert_eq!(snapshot.moments.count, 6000);
    // Mean over all 6000, not just the reservoir
    assert!((snapshot.moments.mean().unwrap() - 2999.5).abs() < 1e-9);
}

// ============================================================================
// Service loops
// ============================================================================

#[derive(Default)]
struct CaptureSink {
    reports: Mutex<Vec<Report>>,
}

impl ReportSink for CaptureSink {
    fn deliver(&self, report: &Report) {
        self.reports.lock().push(report.clone());
    }
}

async fn publish_result(broker: &MemoryBroker, payload: &[u8]) {
    broker
        .publish("results_queue", payload.to_vec(), Persistence::Persistent)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_consumer_folds_results_and_rejects_garbage() {
    let broker = MemoryBroker::new();
    let config = PipelineConfig {
        report_interval_ms: 10,
        ..Default::default()
    };
    broker
        .declare("results_queue", QueueOptions::durable())
        .await
        .unwrap();

    for (worker, value) in [("a", 1.0), ("b", 2.0), ("a", 6.0)] {
        let payload = serde_json::to_vec(&ResultMessage::new(worker, value)).unwrap();
        publish_result(&broker, &payload).await;
    }
    publish_result(&broker, b"not json").await;
    publish_result(&broker, br#"{"worker": "a"}"#).await;

    let sink = Arc::new(CaptureSink::default());
    let service = AggregatorService::new(Arc::new(broker.clone()), &config).with_sink(sink.clone());
    let (trigger, shutdown) = shutdown_channel();
    let task = tokio::spawn({
        let service = service.clone();
        async move { service.run(&shutdown).await }
    });

    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.depth("results_queue").await.unwrap() > 0 || broker.unacked("results_queue") > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    trigger.trigger();
    let report = task.await.unwrap().unwrap();

    assert_eq!(report.kpis.total_processed, 3);
    assert_eq!(report.kpis.mean, Some(3.0));
    let expected_std = (14.0f64 / 3.0).sqrt();
    assert!((report.kpis.std_dev.unwrap() - expected_std).abs() < 1e-12);
    assert_eq!(report.workers[0].worker, "a");
    assert_eq!(report.workers[0].count, 2);
    assert_eq!(report.histogram.total(), 3);

    // Scenario queue was never declared: depth degrades, report continues
    assert_eq!(report.kpis.pending_scenarios, QueueDepth::Unavailable);
    assert_eq!(report.kpis.queued_results, QueueDepth::Available(0));

    let delivered = sink.reports.lock();
    assert!(!delivered.is_empty());
    assert_eq!(delivered.last(), Some(&report));
}

#[tokio::test]
async fn test_report_before_any_result() {
    let broker = MemoryBroker::new();
    let config = PipelineConfig::default();
    broker
        .declare("scenarios_queue", QueueOptions::bounded(10))
        .await
        .unwrap();
    let service = AggregatorService::new(Arc::new(broker), &config);

    let report = service.build_report().await;
    assert_eq!(report.kpis.total_processed, 0);
    assert_eq!(report.kpis.mean, None);
    assert_eq!(report.kpis.pending_scenarios, QueueDepth::Available(0));
    assert_eq!(report.kpis.queued_results, QueueDepth::Unavailable);
}

#[tokio::test]
async fn test_reporter_ticks_until_shutdown() {
    let broker = MemoryBroker::new();
    let config = PipelineConfig {
        report_interval_ms: 10,
        ..Default::default()
    };
    let sink = Arc::new(CaptureSink::default());
    let service = AggregatorService::new(Arc::new(broker), &config).with_sink(sink.clone());
    let (trigger, shutdown) = shutdown_channel();

    let task = tokio::spawn({
        let service = service.clone();
        async move { service.run_reporter(&shutdown).await }
    });
    tokio::time::sleep(Duration::from_millis(80)).await;
    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();

    // Several ticks plus the final report
    assert!(sink.reports.lock().len() >= 3);
}
