//! rdkafka-backed broker clients.

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::broker::{BrokerConsumer, BrokerError, InboundMessage, Record, TransactionalProducer};
use crate::config::QueueConfig;

/// Idempotent transactional producer settings.
pub fn producer_config(config: &QueueConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("client.id", &config.client_id)
        .set("transactional.id", config.transactional_id())
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set(
            "max.in.flight.requests.per.connection",
            config.max_in_flight.to_string(),
        )
        .set("retries", config.retries.to_string())
        .set("linger.ms", config.linger_ms.to_string())
        .set("request.timeout.ms", config.request_timeout_ms.to_string())
        // librdkafka requires message.timeout.ms <= transaction.timeout.ms
        .set("message.timeout.ms", config.transaction_timeout_ms.to_string())
        .set(
            "transaction.timeout.ms",
            config.transaction_timeout_ms.to_string(),
        );
    client
}

/// Manual-commit, read-committed consumer settings.
pub fn consumer_config(config: &QueueConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("group.id", &config.group_id)
        .set("client.id", &config.client_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set("isolation.level", "read_committed")
        .set("auto.offset.reset", config.auto_offset_reset.as_str())
        .set("fetch.min.bytes", config.fetch_min_bytes.to_string())
        .set("fetch.max.bytes", config.fetch_max_bytes.to_string())
        .set("fetch.wait.max.ms", config.max_poll_wait_ms.to_string())
        .set("session.timeout.ms", config.session_timeout_ms.to_string());
    client
}

/// Outage errors get their own variant so the poll loop can back off.
fn classify(error: KafkaError, other: fn(String) -> BrokerError) -> BrokerError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::AllBrokersDown) => BrokerError::AllBrokersDown(error.to_string()),
        _ => other(error.to_string()),
    }
}

/// librdkafka transaction calls block until the broker answers.
async fn blocking<F>(call: F, other: fn(String) -> BrokerError) -> Result<(), BrokerError>
where
    F: FnOnce() -> KafkaResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| BrokerError::Client(format!("blocking task failed: {}", e)))?
        .map_err(|e| classify(e, other))
}

pub struct KafkaTransactionalProducer {
    producer: FutureProducer,
    request_timeout: Duration,
    transaction_timeout: Duration,
}

impl KafkaTransactionalProducer {
    /// Create the producer and register its transactional id with the cluster.
    pub async fn new(config: &QueueConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = producer_config(config)
            .create()
            .map_err(|e| classify(e, BrokerError::Client))?;

        let transaction_timeout = config.transaction_timeout();
        let init = producer.clone();
        blocking(
            move || init.init_transactions(transaction_timeout),
            BrokerError::Transaction,
        )
        .await?;

        info!(
            brokers = %config.bootstrap_servers(),
            transactional_id = %config.transactional_id(),
            "Transactional producer initialized"
        );

        Ok(Self {
            producer,
            request_timeout: config.request_timeout(),
            transaction_timeout,
        })
    }
}

#[async_trait]
impl TransactionalProducer for KafkaTransactionalProducer {
    async fn begin(&self) -> Result<(), BrokerError> {
        self.producer
            .begin_transaction()
            .map_err(|e| classify(e, BrokerError::Transaction))
    }

    async fn send(&self, record: Record) -> Result<(), BrokerError> {
        let mut future_record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&record.topic).payload(record.payload.as_slice());
        if let Some(key) = &record.key {
            future_record = future_record.key(key.as_slice());
        }

        let (partition, offset) = self
            .producer
            .send(future_record, Timeout::After(self.request_timeout))
            .await
            .map_err(|(e, _)| classify(e, BrokerError::Produce))?;

        debug!(topic = %record.topic, partition, offset, "Record enqueued in transaction");
        Ok(())
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        let timeout = self.transaction_timeout;
        blocking(
            move || producer.commit_transaction(timeout),
            BrokerError::Transaction,
        )
        .await
    }

    async fn abort(&self) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        let timeout = self.transaction_timeout;
        blocking(
            move || producer.abort_transaction(timeout),
            BrokerError::Transaction,
        )
        .await
    }

    /// Lightweight health check by fetching cluster metadata
    async fn health_check(&self) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        let timeout = self.request_timeout;
        blocking(
            move || producer.client().fetch_metadata(None, timeout).map(|_| ()),
            BrokerError::Client,
        )
        .await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        let timeout = self.request_timeout;
        blocking(move || producer.flush(timeout), BrokerError::Client).await
    }
}

/// Offsets to commit once `message` was dispatched: the next one to read.
pub fn commit_offsets(message: &InboundMessage) -> KafkaResult<TopicPartitionList> {
    let mut offsets = TopicPartitionList::new();
    offsets.add_partition_offset(
        &message.topic,
        message.partition,
        Offset::Offset(message.offset + 1),
    )?;
    Ok(offsets)
}

pub struct KafkaPollingConsumer {
    consumer: Arc<StreamConsumer>,
    topics: Mutex<BTreeSet<String>>,
}

impl KafkaPollingConsumer {
    pub fn new(config: &QueueConfig) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = consumer_config(config)
            .create()
            .map_err(|e| classify(e, BrokerError::Client))?;

        info!(
            brokers = %config.bootstrap_servers(),
            group = %config.group_id,
            "Consumer created"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topics: Mutex::new(BTreeSet::new()),
        })
    }
}

#[async_trait]
impl BrokerConsumer for KafkaPollingConsumer {
    /// Subscriptions replace each other, so the whole joined set is resubscribed.
    fn join(&self, topic: &str) -> Result<(), BrokerError> {
        let mut topics = self.topics.lock();
        let mut wanted = topics.clone();
        wanted.insert(topic.to_string());

        let names: Vec<&str> = wanted.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| classify(e, BrokerError::Subscribe))?;

        *topics = wanted;
        Ok(())
    }

    async fn poll(&self, max_wait: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        match tokio::time::timeout(max_wait, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(classify(e, BrokerError::Client)),
            Ok(Ok(message)) => Ok(Some(InboundMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(Arc::from),
                payload: Arc::from(message.payload().unwrap_or_default()),
            })),
        }
    }

    /// Synchronous so a failed commit is reported; it waits for the broker on
    /// the blocking pool.
    async fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        let offsets = commit_offsets(message).map_err(|e| classify(e, BrokerError::Commit))?;

        let consumer = Arc::clone(&self.consumer);
        blocking(
            move || consumer.commit(&offsets, CommitMode::Sync),
            BrokerError::Commit,
        )
        .await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.consumer.unsubscribe();
        self.topics.lock().clear();
        Ok(())
    }
}
