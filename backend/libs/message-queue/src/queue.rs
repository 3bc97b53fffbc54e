//! Queue orchestrator: one per consumer group.
//!
//! Owns the publisher, the consumer, the subscription registry, the dispatch
//! worker pool and the poll loop, and shuts them down in order on [`Queue::close`].

use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConsumer, InboundMessage, Record, TransactionalProducer};
use crate::config::QueueConfig;
use crate::consumer::PollingConsumer;
use crate::context::Context;
use crate::dispatch::Dispatcher;
use crate::error::{QueueError, QueueResult};
use crate::kafka::{KafkaPollingConsumer, KafkaTransactionalProducer};
use crate::metrics::QueueMetrics;
use crate::publisher::TransactionalPublisher;
use crate::registry::{Handler, SubscriptionRegistry};
use crate::tracer::{Tracer, TracingTracer};
use crate::worker_pool::WorkerPool;

/// Lifecycle of a [`Queue`]. A queue is running as soon as it is built and
/// never returns to `Running` once closing started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Running,
    ShuttingDown,
    Closed,
}

pub struct QueueBuilder {
    config: QueueConfig,
    tracer: Arc<dyn Tracer>,
    metrics: Option<QueueMetrics>,
}

impl QueueBuilder {
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Create the Kafka producer and consumer and start the queue.
    pub async fn connect(self) -> QueueResult<Queue> {
        self.config.check()?;

        let producer = KafkaTransactionalProducer::new(&self.config)
            .await
            .map_err(QueueError::Connect)?;
        let consumer = KafkaPollingConsumer::new(&self.config).map_err(QueueError::Connect)?;

        self.start_with(Arc::new(producer), Arc::new(consumer))
    }

    /// Start the queue over already created broker clients.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start_with(
        self,
        producer: Arc<dyn TransactionalProducer>,
        consumer: Arc<dyn BrokerConsumer>,
    ) -> QueueResult<Queue> {
        let QueueBuilder {
            config,
            tracer,
            metrics,
        } = self;
        config.check()?;

        let lifetime = Context::background();
        let registry = Arc::new(SubscriptionRegistry::new());

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&consumer),
            Arc::clone(&tracer),
            metrics.clone(),
            lifetime.clone(),
            config.handler_timeout(),
        );
        let pool = WorkerPool::new(
            config.worker_capacity,
            config.worker_queue_size,
            move |message: InboundMessage| {
                let dispatcher = dispatcher.clone();
                async move {
                    dispatcher.dispatch(message).await?;
                    Ok(())
                }
            },
        )
        .map_err(|e| QueueError::Config(e.to_string()))?;
        let pool = Arc::new(pool);
        pool.start().map_err(|e| QueueError::Config(e.to_string()))?;

        let poll_loop = tokio::spawn(
            PollingConsumer {
                consumer: Arc::clone(&consumer),
                pool: Arc::clone(&pool),
                lifetime: lifetime.clone(),
                max_poll_wait: config.max_poll_wait(),
                outage_backoff: config.outage_backoff(),
                metrics: metrics.clone(),
            }
            .run(),
        );

        info!(
            group = %config.group_id,
            workers = config.worker_capacity,
            queue_size = config.worker_queue_size,
            "Queue started"
        );

        Ok(Queue {
            publisher: TransactionalPublisher::new(producer, tracer, metrics),
            config,
            state: Mutex::new(QueueState::Running),
            lifetime,
            consumer,
            registry,
            pool,
            poll_loop: Mutex::new(Some(poll_loop)),
        })
    }
}

/// Transactional publishing plus topic fan-out to registered handlers.
///
/// ```no_run
/// use message_queue::{Context, Queue, QueueConfig};
///
/// # async fn run() -> message_queue::QueueResult<()> {
/// let queue = Queue::connect(QueueConfig::new("order-service")).await?;
///
/// queue.subscribe("orders.created", |_ctx, message| async move {
///     tracing::info!(offset = message.offset, "order created");
///     Ok(())
/// })?;
///
/// queue.produce(&Context::background(), "orders.created", b"{}".to_vec()).await?;
/// queue.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Queue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    lifetime: Context,
    publisher: TransactionalPublisher,
    consumer: Arc<dyn BrokerConsumer>,
    registry: Arc<SubscriptionRegistry>,
    pool: Arc<WorkerPool<InboundMessage>>,
    poll_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    pub fn builder(config: QueueConfig) -> QueueBuilder {
        QueueBuilder {
            config,
            tracer: TracingTracer::shared(),
            metrics: None,
        }
    }

    /// Shorthand for `Queue::builder(config).connect()`.
    pub async fn connect(config: QueueConfig) -> QueueResult<Self> {
        Self::builder(config).connect().await
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn state(&self) -> QueueState {
        *self.state.lock()
    }

    /// Topics with at least one handler, sorted.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.registry.topics()
    }

    fn ensure_running(&self) -> QueueResult<()> {
        match self.state() {
            QueueState::Running => Ok(()),
            _ => Err(QueueError::Closed),
        }
    }

    /// Publish `payload` to `topic` in its own transaction.
    pub async fn produce(
        &self,
        ctx: &Context,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> QueueResult<()> {
        self.ensure_running()?;
        self.publisher.publish(ctx, Record::new(topic, payload)).await
    }

    /// Like [`produce`](Self::produce) with a partition key.
    pub async fn produce_keyed(
        &self,
        ctx: &Context,
        topic: &str,
        key: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
    ) -> QueueResult<()> {
        self.ensure_running()?;
        self.publisher
            .publish(ctx, Record::new(topic, payload).with_key(key))
            .await
    }

    /// Register `handler` for `topic`.
    ///
    /// The first handler of a topic makes the consumer join it; later handlers
    /// are appended and see every message dispatched after they were added.
    /// Messages already committed are not redelivered to new handlers.
    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> QueueResult<()>
    where
        F: Fn(Context, InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.ensure_running()?;

        let handler: Handler = Arc::new(move |ctx, message| handler(ctx, message).boxed());
        let joined = self
            .registry
            .register(topic, handler, || self.consumer.join(topic))
            .map_err(|source| QueueError::Subscribe {
                topic: topic.to_string(),
                source,
            })?;

        if joined {
            info!(topic = %topic, group = %self.config.group_id, "Joined topic");
        } else {
            debug!(
                topic = %topic,
                handlers = self.registry.handler_count(topic),
                "Added handler to joined topic"
            );
        }
        Ok(())
    }

    /// Probe the producer's broker connection.
    pub async fn health_check(&self) -> QueueResult<()> {
        self.publisher.health_check().await
    }

    /// Stop polling, drain the worker pool, then close the consumer and the
    /// producer, in that order. Returns once everything is closed.
    pub async fn close(&self) -> QueueResult<()> {
        {
            let mut state = self.state.lock();
            if *state != QueueState::Running {
                return Err(QueueError::Closed);
            }
            *state = QueueState::ShuttingDown;
        }
        info!(group = %self.config.group_id, "Closing queue");

        self.lifetime.cancel();
        self.pool.graceful_shutdown().await;

        let mut problems = Vec::new();

        let poll_loop = self.poll_loop.lock().take();
        if let Some(handle) = poll_loop {
            if let Err(e) = handle.await {
                error!(error = %e, "Poll loop terminated abnormally");
                problems.push(format!("poll loop: {}", e));
            }
        }

        if let Err(e) = self.consumer.close().await {
            error!(error = %e, "Failed to close consumer");
            problems.push(format!("consumer: {}", e));
        }
        if let Err(e) = self.publisher.close().await {
            error!(error = %e, "Failed to close producer");
            problems.push(format!("producer: {}", e));
        }

        *self.state.lock() = QueueState::Closed;

        if problems.is_empty() {
            info!(group = %self.config.group_id, "Queue closed");
            Ok(())
        } else {
            Err(QueueError::Shutdown(problems.join("; ")))
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if *self.state.get_mut() == QueueState::Running {
            warn!(group = %self.config.group_id, "Queue dropped without close, cancelling background tasks");
            self.lifetime.cancel();
        }
    }
}
