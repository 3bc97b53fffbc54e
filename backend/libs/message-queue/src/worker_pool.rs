//! Fixed-size worker pool draining a bounded queue.
//!
//! `push` waits while the queue is full, so a slow consumer of the pool applies
//! backpressure to the producer of work instead of dropping items.
//! `graceful_shutdown` stops intake and waits until every queued item has been
//! processed and every worker has exited.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::PoolError;

type ProcessFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct WorkerPool<T> {
    capacity: usize,
    queue_size: usize,
    process: ProcessFn<T>,
    sender: Mutex<Option<mpsc::Sender<T>>>,
    receiver: Mutex<Option<mpsc::Receiver<T>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    live: Arc<AtomicUsize>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool of `capacity` workers over a queue of `queue_size` slots.
    ///
    /// `process` is invoked once per pushed item. Errors and panics are logged
    /// per item and never stop a worker.
    pub fn new<F, Fut>(capacity: usize, queue_size: usize, process: F) -> Result<Self, PoolError>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if capacity == 0 {
            return Err(PoolError::InvalidConfig("capacity must be at least 1"));
        }
        if queue_size == 0 {
            return Err(PoolError::InvalidConfig("queue size must be at least 1"));
        }

        let (tx, rx) = mpsc::channel(queue_size);
        let process: ProcessFn<T> = Arc::new(move |item| process(item).boxed());

        Ok(Self {
            capacity,
            queue_size,
            process,
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            workers: Mutex::new(Vec::with_capacity(capacity)),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Spawn exactly `capacity` workers. Must run inside a Tokio runtime.
    pub fn start(&self) -> Result<(), PoolError> {
        let rx = self.receiver.lock().take().ok_or(PoolError::AlreadyStarted)?;
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = self.workers.lock();
        for id in 0..self.capacity {
            let rx = Arc::clone(&rx);
            let process = Arc::clone(&self.process);
            let alive = LiveWorker::enter(&self.live);
            workers.push(tokio::spawn(run_worker(id, rx, process, alive)));
        }

        info!(
            capacity = self.capacity,
            queue_size = self.queue_size,
            "Worker pool started"
        );
        Ok(())
    }

    /// Enqueue an item, waiting for a free slot when the queue is full.
    pub async fn push(&self, item: T) -> Result<(), PoolError> {
        // Clone so the lock is not held across the await.
        let sender = self.sender.lock().clone().ok_or(PoolError::Closed)?;
        sender.send(item).await.map_err(|_| PoolError::Closed)
    }

    /// Workers spawned by `start` that have not exited yet.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Items queued but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|tx| self.queue_size - tx.capacity())
            .unwrap_or(0)
    }

    /// Close the queue and wait for all queued and in-flight items to finish.
    ///
    /// Items already handed to a worker run to completion. Calling this more
    /// than once is harmless.
    pub async fn graceful_shutdown(&self) {
        drop(self.sender.lock().take());

        // Never started: nothing will ever drain the queue, discard it.
        if let Some(mut rx) = self.receiver.lock().take() {
            rx.close();
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task terminated abnormally");
            }
        }

        info!("Worker pool shut down");
    }
}

async fn run_worker<T>(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
    process: ProcessFn<T>,
    _alive: LiveWorker,
) {
    debug!(worker = id, "Worker started");

    loop {
        // Hold the receiver lock only while waiting for the next item.
        let item = { rx.lock().await.recv().await };
        let Some(item) = item else { break };

        match AssertUnwindSafe(process(item)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(worker = id, error = %e, "Failed to process item"),
            Err(panic) => error!(
                worker = id,
                panic = %panic_message(&panic),
                "Item processing panicked"
            ),
        }
    }

    debug!(worker = id, "Worker exited");
}

/// Counts a worker as live until its task finishes or is dropped.
struct LiveWorker(Arc<AtomicUsize>);

impl LiveWorker {
    fn enter(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
