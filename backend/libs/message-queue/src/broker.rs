//! Broker client seam.
//!
//! The orchestrator only talks to the log through [`TransactionalProducer`] and
//! [`BrokerConsumer`]. [`crate::kafka`] implements them over `rdkafka`,
//! [`crate::memory`] implements them in-process.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A record submitted for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    /// Partition key; records without a key are spread by the client
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// A message delivered by the consumer during polling.
///
/// Cloning is cheap: key and payload are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Arc<[u8]>>,
    pub payload: Arc<[u8]>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: &[u8]) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: Arc::from(payload),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }
}

/// Errors reported by broker clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// No broker in the bootstrap list is reachable
    #[error("All brokers down: {0}")]
    AllBrokersDown(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Produce failed: {0}")]
    Produce(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Offset commit failed: {0}")]
    Commit(String),

    #[error("Subscription failed: {0}")]
    Subscribe(String),

    #[error("Client is closed")]
    Closed,
}

impl BrokerError {
    /// Total broker unavailability; the poll loop backs off on these.
    pub fn is_outage(&self) -> bool {
        matches!(self, BrokerError::AllBrokersDown(_))
    }
}

/// Producer configured for idempotent, transactional delivery.
///
/// At most one transaction is open at a time; callers serialise
/// `begin → send → commit | abort`.
#[async_trait]
pub trait TransactionalProducer: Send + Sync {
    async fn begin(&self) -> Result<(), BrokerError>;

    /// Enqueue a record inside the open transaction.
    async fn send(&self, record: Record) -> Result<(), BrokerError>;

    async fn commit(&self) -> Result<(), BrokerError>;

    async fn abort(&self) -> Result<(), BrokerError>;

    /// Lightweight readiness probe.
    async fn health_check(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Consumer group member with manual offset commit at read-committed isolation.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Add `topic` to the group subscription.
    fn join(&self, topic: &str) -> Result<(), BrokerError>;

    /// Wait at most `max_wait` for the next message. `Ok(None)` means nothing arrived.
    async fn poll(&self, max_wait: Duration) -> Result<Option<InboundMessage>, BrokerError>;

    /// Commit `message.offset + 1` for the message's topic and partition.
    async fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
