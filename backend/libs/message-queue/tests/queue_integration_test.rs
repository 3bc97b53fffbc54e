//! End-to-end behaviour of the queue against the in-memory broker.

use message_queue::memory::MemoryBroker;
use message_queue::{
    BrokerConsumer, Context, Dispatcher, InboundMessage, OffsetReset, Queue, QueueConfig,
    QueueError, QueueState, SubscriptionRegistry, TracingTracer,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const TOPIC: &str = "orders.created";
const GROUP: &str = "order-service";
const WAIT: Duration = Duration::from_secs(5);

fn config() -> QueueConfig {
    let mut config = QueueConfig::new(GROUP);
    config.max_poll_wait_ms = 10;
    config.worker_capacity = 2;
    config.worker_queue_size = 4;
    config.auto_offset_reset = OffsetReset::Earliest;
    config
}

fn start(broker: &MemoryBroker) -> Queue {
    Queue::builder(config())
        .start_with(
            Arc::new(broker.producer()),
            Arc::new(broker.consumer(GROUP, OffsetReset::Earliest)),
        )
        .unwrap()
}

/// Subscribe a handler that forwards `(tag, payload)` of every message.
fn forward(queue: &Queue, tag: &'static str, tx: &mpsc::UnboundedSender<(&'static str, Vec<u8>)>) {
    let tx = tx.clone();
    queue
        .subscribe(TOPIC, move |_, message| {
            let tx = tx.clone();
            async move {
                tx.send((tag, message.payload().to_vec()))?;
                Ok(())
            }
        })
        .unwrap();
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

#[tokio::test]
async fn test_published_record_reaches_subscriber() {
    let broker = MemoryBroker::new();
    let queue = start(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();
    forward(&queue, "audit", &tx);

    queue
        .produce(&Context::background(), TOPIC, b"X".to_vec())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, ("audit", b"X".to_vec()));

    queue.close().await.unwrap();
    assert_eq!(queue.state(), QueueState::Closed);
    assert_eq!(broker.committed_offset(GROUP, TOPIC), Some(1));
}

#[tokio::test]
async fn test_keyed_record_keeps_its_key() {
    let broker = MemoryBroker::new();
    let queue = start(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();
    queue
        .subscribe(TOPIC, move |_, message| {
            let tx = tx.clone();
            async move {
                tx.send(message.key().map(<[u8]>::to_vec))?;
                Ok(())
            }
        })
        .unwrap();

    queue
        .produce_keyed(&Context::background(), TOPIC, b"order-42".to_vec(), b"X".to_vec())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, Some(b"order-42".to_vec()));
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_publish_is_never_visible() {
    let broker = MemoryBroker::new();
    let queue = start(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();
    forward(&queue, "audit", &tx);

    let ctx = Context::background();
    ctx.cancel();
    let err = queue.produce(&ctx, TOPIC, b"lost".to_vec()).await.unwrap_err();
    assert!(matches!(err, QueueError::PublishCancelled(_)));

    let expired = Context::background().with_timeout(Duration::ZERO);
    let err = queue.produce(&expired, TOPIC, b"late".to_vec()).await.unwrap_err();
    assert!(matches!(err, QueueError::PublishCancelled(_)));

    queue
        .produce(&Context::background(), TOPIC, b"kept".to_vec())
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await, ("audit", b"kept".to_vec()));

    queue.close().await.unwrap();
    assert_eq!(broker.visible_records(TOPIC), vec![b"kept".to_vec()]);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_uncommitted_message_is_redelivered_to_the_group() {
    let broker = MemoryBroker::new();
    broker.fail_next_offset_commit();

    let first = start(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();
    forward(&first, "audit", &tx);
    first
        .produce(&Context::background(), TOPIC, b"X".to_vec())
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await, ("audit", b"X".to_vec()));
    // close drains the in-flight dispatch, whose commit fails
    first.close().await.unwrap();
    assert_eq!(broker.committed_offset(GROUP, TOPIC), None);

    let second = start(&broker);
    forward(&second, "audit", &tx);
    assert_eq!(next(&mut rx).await, ("audit", b"X".to_vec()));
    second.close().await.unwrap();

    assert_eq!(broker.committed_offset(GROUP, TOPIC), Some(1));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_failing_handler_does_not_block_siblings_or_commit() {
    let broker = MemoryBroker::new();
    let queue = start(&broker);
    queue
        .subscribe(TOPIC, |_, _| async { Err::<(), _>(anyhow::anyhow!("search index down")) })
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    forward(&queue, "email", &tx);

    queue
        .produce(&Context::background(), TOPIC, b"X".to_vec())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, ("email", b"X".to_vec()));
    queue.close().await.unwrap();
    assert_eq!(broker.committed_offset(GROUP, TOPIC), Some(1));
}

#[tokio::test]
async fn test_handler_panicking_before_its_future_does_not_block_commit() {
    let broker = MemoryBroker::new();
    let queue = start(&broker);
    queue
        .subscribe(TOPIC, |_, message: InboundMessage| {
            if message.offset >= 0 {
                panic!("malformed order");
            }
            async { Ok::<(), anyhow::Error>(()) }
        })
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    forward(&queue, "email", &tx);

    queue
        .produce(&Context::background(), TOPIC, b"X".to_vec())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, ("email", b"X".to_vec()));
    queue.close().await.unwrap();
    assert_eq!(broker.committed_offset(GROUP, TOPIC), Some(1));
}

#[tokio::test]
async fn test_late_subscription_joins_once_and_fans_out() {
    let broker = MemoryBroker::new();
    let queue = start(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    forward(&queue, "audit", &tx);
    forward(&queue, "email", &tx);
    assert_eq!(broker.join_count(GROUP), 1);

    for payload in [b"A", b"B"] {
        queue
            .produce(&Context::background(), TOPIC, payload.to_vec())
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(next(&mut rx).await);
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("audit", b"A".to_vec()),
            ("audit", b"B".to_vec()),
            ("email", b"A".to_vec()),
            ("email", b"B".to_vec()),
        ]
    );

    queue.close().await.unwrap();
    assert_eq!(broker.join_count(GROUP), 1);
}

#[tokio::test]
async fn test_message_committed_before_subscription_is_not_redelivered() {
    let broker = MemoryBroker::new();
    let ctx = Context::background();
    let producer = broker.producer();
    let publisher = message_queue::TransactionalPublisher::new(
        Arc::new(producer),
        TracingTracer::shared(),
        None,
    );
    publisher
        .publish(&ctx, message_queue::Record::new(TOPIC, b"X".to_vec()))
        .await
        .unwrap();

    // X is dispatched while no handler exists: zero invocations, offset committed
    let consumer = Arc::new(broker.consumer(GROUP, OffsetReset::Earliest));
    consumer.join(TOPIC).unwrap();
    let message: InboundMessage = consumer.poll(WAIT).await.unwrap().unwrap();
    let dispatcher = Dispatcher::new(
        Arc::new(SubscriptionRegistry::new()),
        consumer.clone(),
        TracingTracer::shared(),
        None,
        Context::background(),
        Duration::from_secs(1),
    );
    let outcome = dispatcher.dispatch(message).await.unwrap();
    assert_eq!(outcome.handlers_invoked, 0);
    assert_eq!(broker.committed_offset(GROUP, TOPIC), Some(1));

    // subscribing afterwards only sees newly published messages
    let queue = start(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();
    forward(&queue, "audit", &tx);
    queue.produce(&ctx, TOPIC, b"Y".to_vec()).await.unwrap();

    assert_eq!(next(&mut rx).await, ("audit", b"Y".to_vec()));
    queue.close().await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_close_processes_everything_already_polled() {
    let broker = MemoryBroker::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let queue = start(&broker);

    let counter = Arc::clone(&handled);
    let (tx, mut rx) = mpsc::unbounded_channel();
    queue
        .subscribe(TOPIC, move |_, _| {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            async move {
                tx.send(())?;
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    queue
        .produce(&Context::background(), TOPIC, b"slow".to_vec())
        .await
        .unwrap();
    next(&mut rx).await;

    // the handler is mid-flight; close waits for it and for its commit
    queue.close().await.unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(broker.committed_offset(GROUP, TOPIC), Some(1));
}

#[tokio::test]
async fn test_outage_does_not_stop_the_queue() {
    let broker = MemoryBroker::new();
    let mut config = config();
    config.outage_backoff_ms = 20;
    let queue = Queue::builder(config)
        .start_with(
            Arc::new(broker.producer()),
            Arc::new(broker.consumer(GROUP, OffsetReset::Earliest)),
        )
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    forward(&queue, "audit", &tx);

    broker.set_available(false);
    assert!(queue.health_check().await.is_err());
    tokio::time::sleep(Duration::from_millis(60)).await;
    broker.set_available(true);

    queue
        .produce(&Context::background(), TOPIC, b"after".to_vec())
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await, ("audit", b"after".to_vec()));
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_queues_in_one_process_do_not_share_subscriptions() {
    let broker = MemoryBroker::new();
    let orders = start(&broker);
    let billing = Queue::builder(QueueConfig::new("billing"))
        .start_with(
            Arc::new(broker.producer()),
            Arc::new(broker.consumer("billing", OffsetReset::Earliest)),
        )
        .unwrap();

    orders.subscribe(TOPIC, |_, _| async { Ok(()) }).unwrap();

    assert_eq!(orders.subscribed_topics(), vec![TOPIC.to_string()]);
    assert!(billing.subscribed_topics().is_empty());

    orders.close().await.unwrap();
    billing.close().await.unwrap();
}
