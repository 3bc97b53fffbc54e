//! Background poll loop feeding the dispatch worker pool.
//!
//! The loop never commits offsets; that happens in [`Dispatcher`](crate::dispatch::Dispatcher)
//! after a message's handlers ran. Its only exit is cancellation of the queue's lifetime.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConsumer, InboundMessage};
use crate::context::Context;
use crate::metrics::QueueMetrics;
use crate::worker_pool::WorkerPool;

pub(crate) struct PollingConsumer {
    pub(crate) consumer: Arc<dyn BrokerConsumer>,
    pub(crate) pool: Arc<WorkerPool<InboundMessage>>,
    pub(crate) lifetime: Context,
    pub(crate) max_poll_wait: Duration,
    pub(crate) outage_backoff: Duration,
    pub(crate) metrics: Option<QueueMetrics>,
}

impl PollingConsumer {
    pub(crate) async fn run(self) {
        info!(
            max_poll_wait_ms = self.max_poll_wait.as_millis() as u64,
            "Poll loop started"
        );
        let token = self.lifetime.token().clone();

        loop {
            let polled = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                polled = self.consumer.poll(self.max_poll_wait) => polled,
            };

            match polled {
                Ok(Some(message)) => {
                    let topic = message.topic.clone();
                    let offset = message.offset;

                    // Waits here while the pool queue is full.
                    let pushed = tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            debug!(topic = %topic, offset, "Shutdown while queue full, message left uncommitted");
                            break;
                        }
                        pushed = self.pool.push(message) => pushed,
                    };
                    if let Err(e) = pushed {
                        warn!(topic = %topic, offset, error = %e, "Worker pool rejected message");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.poll_errors.inc();
                    }

                    let pause = if e.is_outage() {
                        warn!(
                            error = %e,
                            backoff_ms = self.outage_backoff.as_millis() as u64,
                            "All brokers down, backing off"
                        );
                        self.outage_backoff
                    } else {
                        error!(error = %e, "Consumer error");
                        self.max_poll_wait
                    };

                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }

        info!("Poll loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffsetReset;
    use crate::memory::MemoryBroker;
    use tokio::sync::{mpsc, Semaphore};

    fn polling(
        broker: &MemoryBroker,
        pool: Arc<WorkerPool<InboundMessage>>,
        lifetime: &Context,
    ) -> PollingConsumer {
        let consumer = broker.consumer("g", OffsetReset::Earliest);
        consumer.join("orders.created").unwrap();
        PollingConsumer {
            consumer: Arc::new(consumer),
            pool,
            lifetime: lifetime.clone(),
            max_poll_wait: Duration::from_millis(10),
            outage_backoff: Duration::from_secs(5),
            metrics: None,
        }
    }

    #[tokio::test]
    async fn test_polled_messages_reach_the_pool_in_offset_order() {
        let broker = MemoryBroker::new();
        for payload in [b"a", b"b", b"c"] {
            broker.append("orders.created", payload);
        }
        let (tx, mut rx) = mpsc::channel(8);
        let pool = Arc::new(
            WorkerPool::new(1, 4, move |msg: InboundMessage| {
                let tx = tx.clone();
                async move {
                    tx.send(msg.offset).await?;
                    Ok(())
                }
            })
            .unwrap(),
        );
        pool.start().unwrap();
        let lifetime = Context::background();
        let handle = tokio::spawn(polling(&broker, Arc::clone(&pool), &lifetime).run());

        let mut offsets = Vec::new();
        for _ in 0..3 {
            offsets.push(rx.recv().await.unwrap());
        }
        assert_eq!(offsets, vec![0, 1, 2]);

        lifetime.cancel();
        handle.await.unwrap();
        pool.graceful_shutdown().await;

        // the loop itself never commits
        assert_eq!(broker.committed_offset("g", "orders.created"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_backs_off_instead_of_spinning() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let pool = Arc::new(WorkerPool::new(1, 1, |_: InboundMessage| async { Ok(()) }).unwrap());
        pool.start().unwrap();
        let lifetime = Context::background();
        let handle = tokio::spawn(polling(&broker, Arc::clone(&pool), &lifetime).run());

        tokio::time::sleep(Duration::from_secs(12)).await;
        // polls at 0s, 5s and 10s
        assert_eq!(broker.poll_count(), 3);

        lifetime.cancel();
        handle.await.unwrap();
        pool.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_blocked_push() {
        let broker = MemoryBroker::new();
        for i in 0..6u8 {
            broker.append("orders.created", &[i]);
        }
        let gate = Arc::new(Semaphore::new(0));
        let worker_gate = Arc::clone(&gate);
        let pool = Arc::new(
            WorkerPool::new(1, 1, move |_: InboundMessage| {
                let gate = Arc::clone(&worker_gate);
                async move {
                    gate.acquire().await?.forget();
                    Ok(())
                }
            })
            .unwrap(),
        );
        pool.start().unwrap();
        let lifetime = Context::background();
        let handle = tokio::spawn(polling(&broker, Arc::clone(&pool), &lifetime).run());

        // one item in the worker, one queued, the loop is stuck pushing the third
        while pool.queued() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        lifetime.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poll loop should stop while blocked on a full queue")
            .unwrap();

        gate.add_permits(16);
        pool.graceful_shutdown().await;
    }
}
