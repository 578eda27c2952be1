//! Recovery from broker failures in the worker, aggregator and model fetch

use async_trait::async_trait;
use montecarlo_core::broker::{
    Broker, BrokerError, Consumer, Delivery, MemoryBroker, Persistence, QueueOptions,
};
use montecarlo_core::distributor::{DistributionError, DistributionMode, ModelDistributor};
use montecarlo_core::models::ResultMessage;
use montecarlo_core::producer::declare_data_queues;
use montecarlo_core::resilience::shutdown_channel;
use montecarlo_core::worker::{Worker, WorkerId};
use montecarlo_core::{AggregatorService, PipelineConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Fault injection
// ============================================================================

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Memory broker whose next `recv`/`publish` calls fail a set number of times
#[derive(Clone)]
struct FaultyBroker {
    inner: MemoryBroker,
    recv_failures: Arc<AtomicU32>,
    publish_failures: Arc<AtomicU32>,
    subscriptions: Arc<AtomicU32>,
}

impl FaultyBroker {
    fn new(inner: MemoryBroker) -> Self {
        Self {
            inner,
            recv_failures: Arc::new(AtomicU32::new(0)),
            publish_failures: Arc::new(AtomicU32::new(0)),
            subscriptions: Arc::new(AtomicU32::new(0)),
        }
    }
}

struct FaultyConsumer {
    inner: Box<dyn Consumer>,
    failures: Arc<AtomicU32>,
}

#[async_trait]
impl Consumer for FaultyConsumer {
    async fn recv(&mut self) -> Result<Delivery, BrokerError> {
        if take_one(&self.failures) {
            return Err(BrokerError::Connection("connection reset by peer".into()));
        }
        self.inner.recv().await
    }

    fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }
}

#[async_trait]
impl Broker for FaultyBroker {
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.inner.declare(queue, options).await
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        persistence: Persistence,
    ) -> Result<(), BrokerError> {
        if take_one(&self.publish_failures) {
            return Err(BrokerError::Connection("channel closed".into()));
        }
        self.inner.publish(queue, payload, persistence).await
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.inner.get(queue).await
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FaultyConsumer {
            inner: self.inner.consume(queue, prefetch).await?,
            failures: Arc::clone(&self.recv_failures),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.inner.ack(delivery).await
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.inner.reject(delivery, requeue).await
    }

    async fn depth(&self, queue: &str) -> Result<usize, BrokerError> {
        self.inner.depth(queue).await
    }

    async fn purge(&self, queue: &str) -> Result<usize, BrokerError> {
        self.inner.purge(queue).await
    }

    async fn write_slot(&self, key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.inner.write_slot(key, payload).await
    }

    async fn read_slot(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        self.inner.read_slot(key).await
    }

    async fn clear_slot(&self, key: &str) -> Result<(), BrokerError> {
        self.inner.clear_slot(key).await
    }

    fn name(&self) -> &str {
        "faulty"
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        model_poll_interval_ms: 5,
        reconnect_delay_ms: 10,
        ..Default::default()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_aggregator_resumes_after_receive_failure() {
    let broker = MemoryBroker::new();
    broker
        .declare("results_queue", QueueOptions::durable())
        .await
        .unwrap();
    for value in [1.0, 2.0, 3.0] {
        let payload = serde_json::to_vec(&ResultMessage::new("w-1", value)).unwrap();
        broker
            .publish("results_queue", payload, Persistence::Persistent)
            .await
            .unwrap();
    }

    let faulty = FaultyBroker::new(broker.clone());
    faulty.recv_failures.store(1, Ordering::SeqCst);
    let service = AggregatorService::new(Arc::new(faulty.clone()), &config());

    let (trigger, shutdown) = shutdown_channel();
    let task = tokio::spawn({
        let service = service.clone();
        async move { service.run_consumer(&shutdown).await }
    });

    tokio::time::timeout(Duration::from_secs(2), async {
        while service.aggregator().snapshot().moments.count < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumption should resume after the failure");
    assert!(!task.is_finished(), "consumer must keep running until shutdown");

    trigger.trigger();
    let consumed = task.await.unwrap().unwrap();
    assert_eq!(consumed, 3);
    assert_eq!(faulty.recv_failures.load(Ordering::SeqCst), 0);
    assert_eq!(faulty.subscriptions.load(Ordering::SeqCst), 2);
    assert_eq!(broker.unacked("results_queue"), 0);
}

#[tokio::test]
async fn test_worker_resumes_after_receive_failure() {
    let broker = MemoryBroker::new();
    let config = config();
    declare_data_queues(&broker, &config).await.unwrap();
    ModelDistributor::new(Arc::new(broker.clone()), &config)
        .publish_model("X*2")
        .await
        .unwrap();
    for n in 0..3 {
        broker
            .publish(
                "scenarios_queue",
                format!(r#"{{"X": {}}}"#, n).into_bytes(),
                Persistence::Persistent,
            )
            .await
            .unwrap();
    }

    let faulty = FaultyBroker::new(broker.clone());
    faulty.recv_failures.store(1, Ordering::SeqCst);
    let mut worker = Worker::new(WorkerId::from("w-1"), Arc::new(faulty.clone()), &config);

    let (trigger, shutdown) = shutdown_channel();
    let task = tokio::spawn(async move { worker.run(&shutdown).await });

    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.depth("results_queue").await.unwrap() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker should resume after the failure");

    trigger.trigger();
    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.published, 3);
    assert_eq!(stats.dropped, 0);
    assert_eq!(faulty.subscriptions.load(Ordering::SeqCst), 2);
    assert_eq!(broker.depth("scenarios_queue").await.unwrap(), 0);
}

#[tokio::test]
async fn test_worker_survives_closed_broker_until_shutdown() {
    let broker = MemoryBroker::new();
    let config = config();
    declare_data_queues(&broker, &config).await.unwrap();
    ModelDistributor::new(Arc::new(broker.clone()), &config)
        .publish_model("X")
        .await
        .unwrap();

    let mut worker = Worker::new(WorkerId::from("w-1"), Arc::new(broker.clone()), &config);
    let (trigger, shutdown) = shutdown_channel();
    let task = tokio::spawn(async move { worker.run(&shutdown).await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    broker.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished(), "a broker failure must not end the worker");

    trigger.trigger();
    let stats = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("shutdown should stop the reconnect loop")
        .unwrap()
        .unwrap();
    assert_eq!(stats.processed, 0);
}

#[tokio::test]
async fn test_failed_republish_returns_model_to_queue() {
    let broker = MemoryBroker::new();
    let config = PipelineConfig {
        model_distribution: DistributionMode::Republish,
        ..config()
    };
    ModelDistributor::new(Arc::new(broker.clone()), &config)
        .publish_model("X + 1")
        .await
        .unwrap();

    let faulty = FaultyBroker::new(broker.clone());
    faulty.publish_failures.store(1, Ordering::SeqCst);
    let distributor = ModelDistributor::new(Arc::new(faulty), &config);

    let err = distributor.try_acquire().await.unwrap_err();
    assert!(matches!(err, DistributionError::Broker(BrokerError::Connection(_))));
    assert_eq!(broker.depth("model_queue").await.unwrap(), 1);
    assert_eq!(broker.unacked("model_queue"), 0);

    let record = distributor.try_acquire().await.unwrap().unwrap();
    assert_eq!(record.formula, "X + 1");
    assert_eq!(broker.depth("model_queue").await.unwrap(), 1);
}
