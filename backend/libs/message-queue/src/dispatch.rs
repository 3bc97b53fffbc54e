//! Fan-out of one inbound message to its topic's handlers, then offset commit.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn, Instrument};

use crate::broker::{BrokerConsumer, InboundMessage};
use crate::context::Context;
use crate::error::{DispatchError, HandlerFailure, HandlerFailureKind};
use crate::metrics::QueueMetrics;
use crate::registry::SubscriptionRegistry;
use crate::tracer::Tracer;
use crate::worker_pool::panic_message;

/// Outcome of a dispatch whose offset was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub handlers_invoked: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    consumer: Arc<dyn BrokerConsumer>,
    tracer: Arc<dyn Tracer>,
    metrics: Option<QueueMetrics>,
    lifetime: Context,
    handler_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        consumer: Arc<dyn BrokerConsumer>,
        tracer: Arc<dyn Tracer>,
        metrics: Option<QueueMetrics>,
        lifetime: Context,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            consumer,
            tracer,
            metrics,
            lifetime,
            handler_timeout,
        }
    }

    /// Run every handler registered for the message's topic, in registration
    /// order, then commit the offset.
    ///
    /// Handlers share one context whose deadline is `handler_timeout` from now.
    /// A failing, timed-out or panicking handler does not stop later handlers
    /// and does not prevent the commit; all failures are returned together.
    pub async fn dispatch(&self, message: InboundMessage) -> Result<Dispatched, DispatchError> {
        let mut span = self.tracer.start_span("queue.dispatch");
        let result = self
            .dispatch_inner(&message)
            .instrument(span.tracing_span())
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.dispatched.inc();
        }
        if let Err(e) = &result {
            span.record_error(e);
        }
        span.end();
        result
    }

    async fn dispatch_inner(&self, message: &InboundMessage) -> Result<Dispatched, DispatchError> {
        let handlers = self.registry.handlers(&message.topic);

        let mut failures = Vec::new();
        if handlers.is_empty() {
            debug!(
                topic = %message.topic,
                offset = message.offset,
                "No handlers registered, committing offset"
            );
        } else {
            let ctx = self.lifetime.with_timeout(self.handler_timeout);
            let deadline = ctx
                .deadline()
                .unwrap_or_else(|| tokio::time::Instant::now() + self.handler_timeout);

            for (index, handler) in handlers.iter().enumerate() {
                // Calling the handler happens inside the guard too: a closure may panic
                // before it returns its future.
                let invocation =
                    AssertUnwindSafe(async { handler(ctx.clone(), message.clone()).await })
                        .catch_unwind();
                let kind = match tokio::time::timeout_at(deadline, invocation).await {
                    Ok(Ok(Ok(()))) => continue,
                    Ok(Ok(Err(e))) => HandlerFailureKind::Failed(format!("{:#}", e)),
                    Ok(Err(panic)) => HandlerFailureKind::Panicked(panic_message(&panic)),
                    Err(_) => HandlerFailureKind::TimedOut,
                };
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    handler = index,
                    failure = ?kind,
                    "Handler failed"
                );
                failures.push(HandlerFailure { index, kind });
            }

            if let Some(metrics) = &self.metrics {
                metrics.handler_failures.inc_by(failures.len() as u64);
            }
        }

        if let Err(source) = self.consumer.commit(message).await {
            error!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %source,
                "Failed to commit offset, message will be redelivered"
            );
            if let Some(metrics) = &self.metrics {
                metrics.commit_failures.inc();
            }
            return Err(DispatchError::Commit {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                handler_failures: failures.len(),
                source,
            });
        }

        if failures.is_empty() {
            Ok(Dispatched {
                handlers_invoked: handlers.len(),
            })
        } else {
            Err(DispatchError::Handlers {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                failures,
            })
        }
    }
}
