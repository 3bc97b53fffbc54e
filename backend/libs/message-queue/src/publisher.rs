//! One-record-per-transaction publishing.

use std::sync::Arc;
use tracing::{debug, warn, Instrument};

use crate::broker::{Record, TransactionalProducer};
use crate::context::Context;
use crate::error::{QueueError, QueueResult};
use crate::metrics::QueueMetrics;
use crate::tracer::Tracer;

/// Wraps an idempotent transactional producer.
///
/// Each [`publish`](Self::publish) runs `begin → send → commit` and aborts on
/// any failure, so a record becomes visible to read-committed consumers only
/// when the whole call succeeds. A producer holds one open transaction at a
/// time; concurrent callers are serialised.
pub struct TransactionalPublisher {
    producer: Arc<dyn TransactionalProducer>,
    transaction_lock: tokio::sync::Mutex<()>,
    tracer: Arc<dyn Tracer>,
    metrics: Option<QueueMetrics>,
}

impl TransactionalPublisher {
    pub fn new(
        producer: Arc<dyn TransactionalProducer>,
        tracer: Arc<dyn Tracer>,
        metrics: Option<QueueMetrics>,
    ) -> Self {
        Self {
            producer,
            transaction_lock: tokio::sync::Mutex::new(()),
            tracer,
            metrics,
        }
    }

    pub async fn publish(&self, ctx: &Context, record: Record) -> QueueResult<()> {
        let mut span = self.tracer.start_span("queue.publish");
        let topic = record.topic.clone();

        let result = self
            .publish_in_transaction(ctx, record)
            .instrument(span.tracing_span())
            .await;

        match &result {
            Ok(()) => {
                debug!(topic = %topic, "Record published");
                if let Some(metrics) = &self.metrics {
                    metrics.published.inc();
                }
            }
            Err(e) => {
                span.record_error(e);
                warn!(topic = %topic, error = %e, "Publish failed, transaction aborted");
                if let Some(metrics) = &self.metrics {
                    metrics.publish_failures.inc();
                }
            }
        }
        span.end();
        result
    }

    async fn publish_in_transaction(&self, ctx: &Context, record: Record) -> QueueResult<()> {
        let _guard = self.transaction_lock.lock().await;

        if let Some(e) = ctx.err() {
            return Err(QueueError::PublishCancelled(e));
        }

        self.producer.begin().await.map_err(QueueError::Publish)?;

        if let Err(e) = self.producer.send(record).await {
            self.abort().await;
            return Err(QueueError::Publish(e));
        }

        // Enqueued but not yet visible: a caller that gave up must not see it land.
        if let Some(e) = ctx.err() {
            self.abort().await;
            return Err(QueueError::PublishCancelled(e));
        }

        if let Err(e) = self.producer.commit().await {
            self.abort().await;
            return Err(QueueError::Publish(e));
        }

        Ok(())
    }

    async fn abort(&self) {
        if let Err(e) = self.producer.abort().await {
            warn!(error = %e, "Failed to abort transaction");
        }
    }

    pub async fn health_check(&self) -> QueueResult<()> {
        self.producer.health_check().await.map_err(QueueError::Broker)
    }

    pub async fn close(&self) -> QueueResult<()> {
        let _guard = self.transaction_lock.lock().await;
        self.producer.close().await.map_err(QueueError::Broker)
    }
}
