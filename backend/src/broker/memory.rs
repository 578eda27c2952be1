//! In-process broker
//!
//! Implements the full [`Broker`] contract in memory so the pipeline can
//! run as one process and so the protocol can be tested without a server.
//!
//! # Critical Invariants
//!
//! 1. **Bounded queues**: a queue declared with `max_length = N` never holds
//!    more than N ready messages; overflow evicts from the head (oldest)
//! 2. **Prefetch quota**: a consumer never holds more than `prefetch`
//!    unacknowledged deliveries
//! 3. **At-least-once**: dropping a consumer returns its unacknowledged
//!    deliveries to the head of the queue, flagged as redelivered

use super::{
    Broker, BrokerError, Connector, Consumer, Delivery, DeliveryTag, Persistence, QueueOptions,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

type ConsumerId = u64;

#[derive(Debug)]
struct Message {
    payload: Vec<u8>,
    persistence: Persistence,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Message>,
    evicted: u64,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            evicted: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Head-drop until the queue fits its bound.
    fn enforce_bound(&mut self) -> usize {
        let Some(max) = self.options.max_length else {
            return 0;
        };
        let mut dropped = 0;
        while self.ready.len() > max {
            self.ready.pop_front();
            dropped += 1;
        }
        self.evicted += dropped as u64;
        dropped
    }
}

#[derive(Debug)]
struct Pending {
    queue: String,
    consumer: Option<ConsumerId>,
    message: Message,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    pending: HashMap<DeliveryTag, Pending>,
    in_flight: HashMap<ConsumerId, usize>,
    slots: HashMap<String, Vec<u8>>,
    next_tag: DeliveryTag,
    next_consumer: ConsumerId,
    closed: bool,
}

impl Inner {
    fn queue_mut(&mut self, queue: &str) -> Result<&mut QueueState, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    /// Pop the head message and register it as pending.
    fn deliver(
        &mut self,
        queue: &str,
        consumer: Option<ConsumerId>,
    ) -> Result<Option<Delivery>, BrokerError> {
        let Some(message) = self.queue_mut(queue)?.ready.pop_front() else {
            return Ok(None);
        };

        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = Delivery {
            tag,
            queue: queue.to_string(),
            payload: message.payload.clone(),
            redelivered: message.redelivered,
        };

        if let Some(id) = consumer {
            *self.in_flight.entry(id).or_insert(0) += 1;
        }
        self.pending.insert(
            tag,
            Pending {
                queue: queue.to_string(),
                consumer,
                message,
            },
        );

        Ok(Some(delivery))
    }

    /// Resolve a pending delivery, optionally returning it to its queue.
    fn settle(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let pending = self
            .pending
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;

        if let Some(id) = pending.consumer {
            if let Some(count) = self.in_flight.get_mut(&id) {
                *count = count.saturating_sub(1);
            }
        }

        if let Some(state) = self.queues.get_mut(&pending.queue) {
            if requeue {
                let mut message = pending.message;
                message.redelivered = true;
                state.ready.push_front(message);
                state.enforce_bound();
            }
            state.notify.notify_waiters();
        }

        Ok(())
    }

    /// Requeue everything a consumer still holds, preserving order.
    fn cancel_consumer(&mut self, id: ConsumerId) {
        let mut tags: Vec<DeliveryTag> = self
            .pending
            .iter()
            .filter(|(_, p)| p.consumer == Some(id))
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so the oldest ends up at the head
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some(pending) = self.pending.remove(&tag) {
                if let Some(state) = self.queues.get_mut(&pending.queue) {
                    let mut message = pending.message;
                    message.redelivered = true;
                    state.ready.push_front(message);
                    state.enforce_bound();
                    state.notify.notify_waiters();
                }
            }
        }
        self.in_flight.remove(&id);
    }
}

/// In-memory broker; clones share the same queues
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages dropped from the head of a bounded queue so far.
    pub fn evicted(&self, queue: &str) -> Option<u64> {
        self.inner.lock().queues.get(queue).map(|q| q.evicted)
    }

    /// Deliveries from `queue` handed out and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .pending
            .values()
            .filter(|p| p.queue == queue)
            .count()
    }

    /// Persistent messages currently ready in `queue`.
    pub fn persistent_ready(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, |q| {
            q.ready
                .iter()
                .filter(|m| m.persistence == Persistence::Persistent)
                .count()
        })
    }

    /// Close the broker: every pending and future operation fails with
    /// [`BrokerError::Closed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for state in inner.queues.values() {
            state.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(BrokerError::Closed);
        }
        match inner.queues.get(queue) {
            Some(existing) if existing.options != options => Err(BrokerError::PreconditionFailed {
                queue: queue.to_string(),
                reason: format!("declared as {:?}, requested {:?}", existing.options, options),
            }),
            Some(_) => Ok(()),
            None => {
                inner.queues.insert(queue.to_string(), QueueState::new(options));
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        persistence: Persistence,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        let state = inner.queue_mut(queue)?;
        state.ready.push_back(Message {
            payload,
            persistence,
            redelivered: false,
        });
        let dropped = state.enforce_bound();
        if dropped > 0 {
            debug!(queue, dropped, total_evicted = state.evicted, "Head-drop eviction");
        }
        state.notify.notify_waiters();
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.inner.lock().deliver(queue, None)
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        let mut inner = self.inner.lock();
        let notify = Arc::clone(&inner.queue_mut(queue)?.notify);
        inner.next_consumer += 1;
        let id = inner.next_consumer;
        inner.in_flight.insert(id, 0);

        Ok(Box::new(MemoryConsumer {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            id,
            prefetch: prefetch.max(1),
            notify,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.inner.lock().settle(delivery.tag, false)
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.inner.lock().settle(delivery.tag, requeue)
    }

    async fn depth(&self, queue: &str) -> Result<usize, BrokerError> {
        Ok(self.inner.lock().queue_mut(queue)?.ready.len())
    }

    async fn purge(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut inner = self.inner.lock();
        let state = inner.queue_mut(queue)?;
        let purged = state.ready.len();
        state.ready.clear();
        Ok(purged)
    }

    async fn write_slot(&self, key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(BrokerError::Closed);
        }
        inner.slots.insert(key.to_string(), payload);
        Ok(())
    }

    async fn read_slot(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(BrokerError::Closed);
        }
        Ok(inner.slots.get(key).cloned())
    }

    async fn clear_slot(&self, key: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(BrokerError::Closed);
        }
        inner.slots.remove(key);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription handed out by [`MemoryBroker::consume`]
pub struct MemoryConsumer {
    inner: Arc<Mutex<Inner>>,
    queue: String,
    id: ConsumerId,
    prefetch: usize,
    notify: Arc<Notify>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn recv(&mut self) -> Result<Delivery, BrokerError> {
        loop {
            // Register interest before checking so a publish in between
            // is not missed
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(BrokerError::Closed);
                }
                let held = inner.in_flight.get(&self.id).copied().unwrap_or(0);
                if held < self.prefetch {
                    if let Some(delivery) = inner.deliver(&self.queue, Some(self.id))? {
                        return Ok(delivery);
                    }
                }
            }
            notified.await;
        }
    }

    fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.get(&self.id).copied().unwrap_or(0)
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.inner.lock().cancel_consumer(self.id);
    }
}

/// Hands out clones of one shared [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    endpoint: String,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker, endpoint: impl Into<String>) -> Self {
        Self {
            broker,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        if self.broker.inner.lock().closed {
            return Err(BrokerError::Connection(format!(
                "{} is closed",
                self.endpoint
            )));
        }
        Ok(Arc::new(self.broker.clone()))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
