//! In-process broker semantics: bounds, prefetch, redelivery

use montecarlo_core::broker::{
    connect_with_retry, Broker, BrokerError, Connector, MemoryBroker, MemoryConnector,
    Persistence, QueueOptions,
};
use montecarlo_core::resilience::{RetryPolicy, Shutdown};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn payload(n: usize) -> Vec<u8> {
    n.to_string().into_bytes()
}

fn decode(bytes: &[u8]) -> usize {
    std::str::from_utf8(bytes).unwrap().parse().unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Bounded queue
// ============================================================================

proptest! {
    #[test]
    fn bounded_queue_keeps_newest(max_len in 1usize..50, published in 0usize..200) {
        runtime().block_on(async {
            let broker = MemoryBroker::new();
            broker.declare("q", QueueOptions::bounded(max_len)).await.unwrap();

            for n in 0..published {
                broker.publish("q", payload(n), Persistence::Persistent).await.unwrap();
                prop_assert!(broker.depth("q").await.unwrap() <= max_len);
            }

            let kept = published.min(max_len);
            prop_assert_eq!(broker.depth("q").await.unwrap(), kept);
            prop_assert_eq!(broker.evicted("q"), Some((published - kept) as u64));

            // Survivors are the most recent, still in publish order
            for expected in (published - kept)..published {
                let delivery = broker.get("q").await.unwrap().unwrap();
                prop_assert_eq!(decode(&delivery.payload), expected);
                broker.ack(&delivery).await.unwrap();
            }
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_unbounded_queue_never_evicts() {
    let broker = MemoryBroker::new();
    broker.declare("q", QueueOptions::durable()).await.unwrap();
    for n in 0..1000 {
        broker.publish("q", payload(n), Persistence::Transient).await.unwrap();
    }
    assert_eq!(broker.depth("q").await.unwrap(), 1000);
    assert_eq!(broker.evicted("q"), Some(0));
    assert_eq!(broker.persistent_ready("q"), 0);
}

// ============================================================================
// Queue management
// ============================================================================

#[tokio::test]
async fn test_undeclared_queue_operations_fail() {
    let broker = MemoryBroker::new();
    assert_eq!(
        broker.depth("missing").await,
        Err(BrokerError::QueueNotFound("missing".into()))
    );
    assert!(broker
        .publish("missing", vec![], Persistence::Persistent)
        .await
        .is_err());
    assert!(broker.consume("missing", 1).await.is_err());
}

#[tokio::test]
async fn test_purge_leaves_unacked_alone() {
    let broker = MemoryBroker::new();
    broker.declare("q", QueueOptions::durable()).await.unwrap();
    for n in 0..5 {
        broker.publish("q", payload(n), Persistence::Persistent).await.unwrap();
    }
    let held = broker.get("q").await.unwrap().unwrap();

    assert_eq!(broker.purge("q").await.unwrap(), 4);
    assert_eq!(broker.depth("q").await.unwrap(), 0);
    assert_eq!(broker.unacked("q"), 1);

    broker.reject(&held, true).await.unwrap();
    assert_eq!(broker.depth("q").await.unwrap(), 1);
}

#[tokio::test]
async fn test_reject_with_requeue_marks_redelivered() {
    let broker = MemoryBroker::new();
    broker.declare("q", QueueOptions::durable()).await.unwrap();
    broker.publish("q", payload(1), Persistence::Persistent).await.unwrap();
    broker.publish("q", payload(2), Persistence::Persistent).await.unwrap();

    let first = broker.get("q").await.unwrap().unwrap();
    assert!(!first.redelivered);
    broker.reject(&first, true).await.unwrap();

    let again = broker.get("q").await.unwrap().unwrap();
    assert_eq!(decode(&again.payload), 1);
    assert!(again.redelivered);

    broker.reject(&again, false).await.unwrap();
    let next = broker.get("q").await.unwrap().unwrap();
    assert_eq!(decode(&next.payload), 2);
}

// ============================================================================
// Consumers
// ============================================================================

#[tokio::test]
async fn test_prefetch_quota_blocks_until_ack() {
    let broker = MemoryBroker::new();
    broker.declare("q", QueueOptions::durable()).await.unwrap();
    for n in 0..3 {
        broker.publish("q", payload(n), Persistence::Persistent).await.unwrap();
    }

    let mut consumer = broker.consume("q", 1).await.unwrap();
    let first = consumer.recv().await.unwrap();
    assert_eq!(consumer.in_flight(), 1);

    // Quota exhausted: a second receive waits
    let blocked = tokio::time::timeout(Duration::from_millis(50), consumer.recv()).await;
    assert!(blocked.is_err());
    assert_eq!(broker.depth("q").await.unwrap(), 2);

    broker.ack(&first).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(1), consumer.recv())
        .await
        .expect("ack frees the quota")
        .unwrap();
    assert_eq!(decode(&second.payload), 1);
}

#[tokio::test]
async fn test_recv_wakes_on_publish() {
    let broker = MemoryBroker::new();
    broker.declare("q", QueueOptions::durable()).await.unwrap();
    let mut consumer = broker.consume("q", 1).await.unwrap();

    let publisher = {
        let broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            broker.publish("q", payload(7), Persistence::Persistent).await.unwrap();
        })
    };

    let delivery = tokio::time::timeout(Duration::from_secs(1), consumer.recv())
        .await
        .expect("publish should wake the consumer")
        .unwrap();
    assert_eq!(decode(&delivery.payload), 7);
    publisher.await.unwrap();
}

#[tokio::test]
async fn test_dropped_consumer_requeues_in_order() {
    let broker = MemoryBroker::new();
    broker.declare("q", QueueOptions::durable()).await.unwrap();
    for n in 0..4 {
        broker.publish("q", payload(n), Persistence::Persistent).await.unwrap();
    }

    {
        let mut consumer = broker.consume("q", 2).await.unwrap();
        consumer.recv().await.unwrap();
        consumer.recv().await.unwrap();
        assert_eq!(broker.unacked("q"), 2);
    }

    assert_eq!(broker.unacked("q"), 0);
    assert_eq!(broker.depth("q").await.unwrap(), 4);
    let head = broker.get("q").await.unwrap().unwrap();
    assert_eq!(decode(&head.payload), 0);
    assert!(head.redelivered);
}

#[tokio::test]
async fn test_close_fails_pending_receive() {
    let broker = MemoryBroker::new();
    broker.declare("q", QueueOptions::durable()).await.unwrap();
    let mut consumer = broker.consume("q", 1).await.unwrap();

    let closer = {
        let broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            broker.close();
        })
    };

    let result = tokio::time::timeout(Duration::from_secs(1), consumer.recv())
        .await
        .expect("close should wake the consumer");
    assert_eq!(result, Err(BrokerError::Closed));
    closer.await.unwrap();
}

// ============================================================================
// Connection retry
// ============================================================================

struct FlakyConnector {
    inner: MemoryConnector,
    failures_left: AtomicU32,
}

#[async_trait::async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::Connection("refused".into()));
        }
        self.inner.connect().await
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }
}

#[tokio::test]
async fn test_connect_retries_until_broker_is_up() {
    let connector = FlakyConnector {
        inner: MemoryConnector::new(MemoryBroker::new(), "localhost"),
        failures_left: AtomicU32::new(3),
    };
    let policy = RetryPolicy::fixed(Duration::from_millis(1));

    let broker = connect_with_retry(&connector, &policy, &Shutdown::never())
        .await
        .unwrap();
    assert_eq!(broker.name(), "memory");
    assert_eq!(connector.failures_left.load(Ordering::SeqCst), 0);
}
