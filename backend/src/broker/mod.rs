//! Broker abstraction
//!
//! The pipeline never talks to a message broker directly; it consumes the
//! capabilities below. Any broker offering durable named queues, manual
//! acknowledgment, per-consumer prefetch, passive depth queries and
//! head-drop bounded queues can sit behind [`Broker`].
//!
//! ## Table of Contents
//! - **Broker**: queue + slot operations
//! - **Consumer**: blocking receive with a prefetch quota
//! - **Connector**: how a component obtains a broker, with retry
//! - **MemoryBroker**: in-process implementation
//! - **connector_for**: picks the implementation named by the configuration

pub mod memory;

pub use memory::{MemoryBroker, MemoryConnector};

use crate::config::PipelineConfig;
use crate::resilience::{RetryError, RetryPolicy, Shutdown};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Identifier of an unacknowledged delivery
pub type DeliveryTag = u64;

/// Errors surfaced by broker operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue {queue} redeclared with different options: {reason}")]
    PreconditionFailed { queue: String, reason: String },

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Broker connection closed")]
    Closed,
}

impl BrokerError {
    /// The connection itself is gone; a new one is needed.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Closed)
    }
}

/// Message durability requested at publish time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    Transient,
    Persistent,
}

/// Queue declaration arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,

    /// Head-drop bound: publishing beyond it evicts the oldest messages
    pub max_length: Option<usize>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            max_length: None,
        }
    }

    pub fn bounded(max_length: usize) -> Self {
        Self {
            durable: true,
            max_length: Some(max_length),
        }
    }
}

/// A message handed to a consumer, pending acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub payload: Vec<u8>,

    /// True if this message was handed out before and never acknowledged
    pub redelivered: bool,
}

/// Broker capabilities consumed by the pipeline
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue (idempotent for identical options).
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Append a message, applying head-drop eviction on bounded queues.
    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        persistence: Persistence,
    ) -> Result<(), BrokerError>;

    /// Non-blocking fetch of the head message, if any.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Subscribe with at most `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, prefetch: usize)
        -> Result<Box<dyn Consumer>, BrokerError>;

    /// Acknowledge a delivery, releasing its prefetch slot.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Reject a delivery, optionally returning it to the head of its queue.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    /// Passive query of ready (undelivered) messages.
    async fn depth(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Drop all ready messages; returns how many were discarded.
    async fn purge(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Overwrite a keyed slot.
    async fn write_slot(&self, key: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Read a keyed slot without consuming it.
    async fn read_slot(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError>;

    async fn clear_slot(&self, key: &str) -> Result<(), BrokerError>;

    /// Broker name for logging
    fn name(&self) -> &str;
}

/// A subscription to one queue
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery within the prefetch quota.
    ///
    /// Cancel-safe: dropping the future never loses a message.
    async fn recv(&mut self) -> Result<Delivery, BrokerError>;

    /// Deliveries handed to this consumer and not yet acknowledged
    fn in_flight(&self) -> usize;
}

/// Obtains a broker handle
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;

    /// Host or address, for logging
    fn endpoint(&self) -> &str;
}

/// Hands out one existing broker handle on every connect.
///
/// For components built around a handle rather than an address;
/// reconnecting re-subscribes on the same handle.
#[derive(Clone)]
pub struct SharedConnector {
    broker: Arc<dyn Broker>,
}

impl SharedConnector {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for SharedConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        Ok(Arc::clone(&self.broker))
    }

    fn endpoint(&self) -> &str {
        self.broker.name()
    }
}

/// Broker implementation a process connects to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Process-local [`MemoryBroker`]; roles in other processes do not see it
    #[default]
    Memory,
}

impl std::str::FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown broker '{}' (expected memory)", other)),
        }
    }
}

/// Connector for the broker named in `config`.
///
/// Every call builds an independent connector; share the returned handle
/// between the components of one process.
pub fn connector_for(config: &PipelineConfig) -> Arc<dyn Connector> {
    match config.broker {
        BrokerKind::Memory => Arc::new(MemoryConnector::new(
            MemoryBroker::new(),
            config.broker_host.clone(),
        )),
    }
}

/// Connect, retrying according to `policy` until success or shutdown.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    policy: &RetryPolicy,
    shutdown: &Shutdown,
) -> Result<Arc<dyn Broker>, RetryError<BrokerError>> {
    let broker = policy
        .execute(shutdown, "broker connect", || connector.connect())
        .await?;
    info!(endpoint = connector.endpoint(), broker = broker.name(), "Connected to broker");
    Ok(broker)
}
