//! Concurrency, backpressure and shutdown properties of the worker pool.

use message_queue::{PoolError, WorkerPool};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_test::assert_pending;

#[tokio::test]
async fn test_never_more_than_capacity_in_flight() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let (current, max, count) = (Arc::clone(&in_flight), Arc::clone(&peak), Arc::clone(&done));
    let pool = WorkerPool::new(3, 5, move |_: u32| {
        let (current, max, count) = (Arc::clone(&current), Arc::clone(&max), Arc::clone(&count));
        async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .unwrap();
    pool.start().unwrap();

    for n in 0..30 {
        pool.push(n).await.unwrap();
    }
    pool.graceful_shutdown().await;

    assert_eq!(done.load(Ordering::SeqCst), 30);
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "peak concurrency was {}", peak);
}

#[tokio::test]
async fn test_push_blocks_when_queue_is_full() {
    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let worker_gate = Arc::clone(&gate);
    let pool = WorkerPool::new(1, 2, move |n: u32| {
        let gate = Arc::clone(&worker_gate);
        let started = started_tx.clone();
        async move {
            started.send(n)?;
            gate.acquire().await?.forget();
            Ok(())
        }
    })
    .unwrap();
    pool.start().unwrap();

    // one item held by the blocked worker, two filling the queue
    pool.push(0).await.unwrap();
    assert_eq!(started_rx.recv().await, Some(0));
    pool.push(1).await.unwrap();
    pool.push(2).await.unwrap();
    assert_eq!(pool.queued(), 2);

    let mut push = tokio_test::task::spawn(pool.push(3));
    assert_pending!(push.poll());
    assert_pending!(push.poll());

    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(5), push)
        .await
        .expect("push should complete once a slot frees up")
        .unwrap();

    gate.add_permits(3);
    pool.graceful_shutdown().await;
}

#[tokio::test]
async fn test_shutdown_processes_every_pushed_item_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let pool = WorkerPool::new(2, 10, move |n: u32| {
        let sink = Arc::clone(&sink);
        async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            sink.lock().push(n);
            Ok(())
        }
    })
    .unwrap();
    pool.start().unwrap();

    for n in 0..10 {
        pool.push(n).await.unwrap();
    }
    pool.graceful_shutdown().await;

    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    assert_eq!(pool.push(11).await, Err(PoolError::Closed));
}

#[tokio::test]
async fn test_no_worker_outlives_graceful_shutdown() {
    let gate = Arc::new(Semaphore::new(0));
    let worker_gate = Arc::clone(&gate);
    let pool = Arc::new(
        WorkerPool::new(4, 8, move |_: u32| {
            let gate = Arc::clone(&worker_gate);
            async move {
                gate.acquire().await?.forget();
                Ok(())
            }
        })
        .unwrap(),
    );
    assert_eq!(pool.live_workers(), 0);
    pool.start().unwrap();
    assert_eq!(pool.live_workers(), 4);

    for n in 0..6 {
        pool.push(n).await.unwrap();
    }
    let shutdown = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.graceful_shutdown().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!shutdown.is_finished());
    assert_eq!(pool.live_workers(), 4);

    gate.add_permits(6);
    tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .expect("shutdown should finish once items complete")
        .unwrap();
    assert_eq!(pool.live_workers(), 0);
}

#[tokio::test]
async fn test_slow_item_does_not_block_other_workers() {
    let gate = Arc::new(Semaphore::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let worker_gate = Arc::clone(&gate);
    let pool = WorkerPool::new(2, 4, move |n: u32| {
        let gate = Arc::clone(&worker_gate);
        let tx = tx.clone();
        async move {
            if n == 0 {
                gate.acquire().await?.forget();
            }
            tx.send(n)?;
            Ok(())
        }
    })
    .unwrap();
    pool.start().unwrap();

    for n in 0..4 {
        pool.push(n).await.unwrap();
    }
    let mut fast = Vec::new();
    for _ in 0..3 {
        fast.push(
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    fast.sort();
    assert_eq!(fast, vec![1, 2, 3]);

    gate.add_permits(1);
    pool.graceful_shutdown().await;
    assert_eq!(rx.recv().await, Some(0));
}
