//! # Message Queue
//!
//! A Kafka-backed message queue for services that publish events and react to
//! them. One [`Queue`] is created per consumer group and provides:
//!
//! - **Transactional publishing**: every [`Queue::produce`] runs in its own
//!   producer transaction, so a record is visible to read-committed consumers
//!   only if the whole call succeeded. A caller whose context is cancelled
//!   before commit gets the transaction aborted.
//! - **Topic fan-out**: [`Queue::subscribe`] registers handlers per topic. The
//!   first handler of a topic joins it on the consumer group; later handlers
//!   are appended and invoked for every message dispatched afterwards.
//! - **Decoupled polling**: a background loop polls the broker and hands
//!   messages to a bounded [`WorkerPool`]. When the pool queue is full the
//!   loop waits, which bounds memory use under slow handlers.
//! - **At-least-once delivery**: an offset is committed only after every
//!   handler of its topic was invoked. Handler failures are reported but do
//!   not block the commit; a failed commit means redelivery after restart.
//! - **Graceful shutdown**: [`Queue::close`] stops polling, drains the pool and
//!   closes the consumer and then the producer.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use message_queue::{Context, Queue, QueueConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = QueueConfig::from_env()?;
//! let queue = Queue::connect(config).await?;
//!
//! queue.subscribe("orders.created", |ctx, message| async move {
//!     if let Some(e) = ctx.err() {
//!         anyhow::bail!("gave up on offset {}: {}", message.offset, e);
//!     }
//!     tracing::info!(bytes = message.payload().len(), "order created");
//!     Ok(())
//! })?;
//!
//! let ctx = Context::background().with_timeout(Duration::from_secs(5));
//! queue.produce(&ctx, "orders.created", br#"{"id":42}"#.to_vec()).await?;
//!
//! queue.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing without Kafka
//!
//! [`memory::MemoryBroker`] implements the same client traits in process and is
//! what the crate's own tests run against:
//!
//! ```rust
//! use message_queue::memory::MemoryBroker;
//! use message_queue::{OffsetReset, Queue, QueueConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let broker = MemoryBroker::new();
//! let queue = Queue::builder(QueueConfig::new("billing"))
//!     .start_with(
//!         Arc::new(broker.producer()),
//!         Arc::new(broker.consumer("billing", OffsetReset::Earliest)),
//!     )
//!     .unwrap();
//! queue.close().await.unwrap();
//! # }
//! ```

pub mod broker;
pub mod config;
mod consumer;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod metrics;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod tracer;
pub mod worker_pool;

pub use broker::{BrokerConsumer, BrokerError, InboundMessage, Record, TransactionalProducer};
pub use config::{OffsetReset, QueueConfig};
pub use context::{Context, ContextError};
pub use dispatch::{Dispatched, Dispatcher};
pub use error::{
    DispatchError, HandlerFailure, HandlerFailureKind, PoolError, QueueError, QueueResult,
};
pub use metrics::QueueMetrics;
pub use publisher::TransactionalPublisher;
pub use queue::{Queue, QueueBuilder, QueueState};
pub use registry::{Handler, SubscriptionRegistry};
pub use tracer::{Span, Tracer, TracingTracer};
pub use worker_pool::WorkerPool;
