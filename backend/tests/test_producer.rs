//! Scenario generation: reset, publication, overflow

use montecarlo_core::broker::{Broker, MemoryBroker, Persistence};
use montecarlo_core::models::{ModelFile, Scenario, VariableSpec};
use montecarlo_core::producer::ScenarioProducer;
use montecarlo_core::resilience::{shutdown_channel, Shutdown};
use montecarlo_core::{PipelineConfig, PipelineError};
use std::collections::BTreeMap;
use std::sync::Arc;

fn model(count: u64) -> ModelFile {
    let mut variables = BTreeMap::new();
    variables.insert(
        "price".to_string(),
        VariableSpec::new("normal", &[("loc", 10.0), ("scale", 2.0)]),
    );
    variables.insert("quantity".to_string(), VariableSpec::new("poisson", &[("lam", 100.0)]));
    variables.insert(
        "cost".to_string(),
        VariableSpec::new("uniform", &[("low", 500.0), ("high", 800.0)]),
    );
    ModelFile {
        model_function: "price * quantity - cost".to_string(),
        variables,
        simulation_count: count,
    }
}

fn seeded() -> PipelineConfig {
    PipelineConfig {
        seed: Some(2024),
        ..Default::default()
    }
}

async fn drain(broker: &MemoryBroker, queue: &str) -> Vec<Scenario> {
    let mut out = Vec::new();
    while let Some(delivery) = broker.get(queue).await.unwrap() {
        out.push(serde_json::from_slice(&delivery.payload).unwrap());
        broker.ack(&delivery).await.unwrap();
    }
    out
}

#[tokio::test]
async fn test_reset_purges_previous_run() {
    let broker = MemoryBroker::new();
    let config = seeded();
    let producer = ScenarioProducer::new(Arc::new(broker.clone()), &config);
    producer.declare_queues().await.unwrap();

    for queue in ["scenarios_queue", "results_queue", "model_queue"] {
        for _ in 0..3 {
            broker
                .publish(queue, b"{}".to_vec(), Persistence::Persistent)
                .await
                .unwrap();
        }
    }

    let summary = producer.reset().await.unwrap();
    assert_eq!((summary.results, summary.scenarios, summary.models), (3, 3, 3));
    assert_eq!(broker.depth("scenarios_queue").await.unwrap(), 0);
    assert_eq!(broker.depth("results_queue").await.unwrap(), 0);
    assert_eq!(broker.depth("model_queue").await.unwrap(), 0);
}

#[tokio::test]
async fn test_run_publishes_model_and_scenarios() {
    let broker = MemoryBroker::new();
    let mut producer = ScenarioProducer::new(Arc::new(broker.clone()), &seeded());

    let report = producer.run(&model(250), &Shutdown::never()).await.unwrap();
    assert_eq!(report.published, 250);
    assert_eq!(broker.depth("model_queue").await.unwrap(), 1);

    let scenarios = drain(&broker, "scenarios_queue").await;
    assert_eq!(scenarios.len(), 250);
    for scenario in &scenarios {
        let keys: Vec<&str> = scenario.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["cost", "price", "quantity"]);
        assert!((500.0..800.0).contains(&scenario["cost"]));
        assert_eq!(scenario["quantity"].fract(), 0.0);
    }
}

#[tokio::test]
async fn test_same_seed_reproduces_run() {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let broker = MemoryBroker::new();
        let mut producer = ScenarioProducer::new(Arc::new(broker.clone()), &seeded());
        producer.run(&model(20), &Shutdown::never()).await.unwrap();
        runs.push(drain(&broker, "scenarios_queue").await);
    }
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn test_overflow_evicts_oldest_scenarios() {
    let broker = MemoryBroker::new();
    let config = PipelineConfig {
        scenario_queue_max_length: 10,
        seed: Some(1),
        ..Default::default()
    };

    // Reference sequence from an unbounded run with the same seed
    let reference = {
        let broker = MemoryBroker::new();
        let mut producer = ScenarioProducer::new(Arc::new(broker.clone()), &seeded_with(1));
        producer.run(&model(25), &Shutdown::never()).await.unwrap();
        drain(&broker, "scenarios_queue").await
    };

    let mut producer = ScenarioProducer::new(Arc::new(broker.clone()), &config);
    let report = producer.run(&model(25), &Shutdown::never()).await.unwrap();
    assert_eq!(report.published, 25);
    assert_eq!(report.evicted_hint, 15);
    assert_eq!(broker.evicted("scenarios_queue"), Some(15));

    let survivors = drain(&broker, "scenarios_queue").await;
    assert_eq!(survivors, reference[15..].to_vec());
}

fn seeded_with(seed: u64) -> PipelineConfig {
    PipelineConfig {
        seed: Some(seed),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_shutdown_interrupts_generation() {
    let broker = MemoryBroker::new();
    let mut producer = ScenarioProducer::new(Arc::new(broker.clone()), &seeded());
    let (trigger, shutdown) = shutdown_channel();
    trigger.trigger();

    let result = producer.run(&model(1000), &shutdown).await;
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert_eq!(broker.depth("scenarios_queue").await.unwrap(), 0);
}

#[tokio::test]
async fn test_invalid_model_is_rejected_before_reset() {
    let broker = MemoryBroker::new();
    let mut producer = ScenarioProducer::new(Arc::new(broker.clone()), &seeded());
    let mut bad = model(5);
    bad.model_function = "  ".to_string();

    assert!(matches!(
        producer.run(&bad, &Shutdown::never()).await,
        Err(PipelineError::Config(_))
    ));
    assert!(broker.depth("model_queue").await.is_err(), "nothing declared yet");
}
