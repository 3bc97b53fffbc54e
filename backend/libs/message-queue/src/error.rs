//! Error types for the message queue library.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::context::ContextError;

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by the public [`Queue`](crate::Queue) operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Configuration rejected during construction
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Broker client could not be created or initialised
    #[error("Connection failed: {0}")]
    Connect(#[source] BrokerError),

    /// Enqueue or commit of a transactional publish failed (transaction aborted)
    #[error("Publish failed: {0}")]
    Publish(#[source] BrokerError),

    /// Caller context ended before the transaction was committed (transaction aborted)
    #[error("Publish cancelled: {0}")]
    PublishCancelled(#[source] ContextError),

    /// Joining a topic on the consumer group failed
    #[error("Subscribe to {topic} failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },

    /// Any other broker client failure
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The queue has been closed (or is closing) and cannot be used
    #[error("Queue is closed")]
    Closed,

    /// A background task did not terminate cleanly during close
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Errors from the [`WorkerPool`](crate::WorkerPool).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("Invalid worker pool configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("Worker pool already started")]
    AlreadyStarted,

    /// The pool no longer accepts work
    #[error("Worker pool is shut down")]
    Closed,
}

/// Why a single handler invocation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerFailureKind {
    Failed(String),
    TimedOut,
    Panicked(String),
}

/// One failed handler of a dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Position of the handler in registration order
    pub index: usize,
    pub kind: HandlerFailureKind,
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            HandlerFailureKind::Failed(reason) => write!(f, "handler #{} failed: {}", self.index, reason),
            HandlerFailureKind::TimedOut => write!(f, "handler #{} timed out", self.index),
            HandlerFailureKind::Panicked(reason) => {
                write!(f, "handler #{} panicked: {}", self.index, reason)
            }
        }
    }
}

/// Errors reported by the dispatch path for one inbound message.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// One or more handlers failed. The offset was committed regardless.
    #[error("{} handler(s) failed for {topic}[{partition}]@{offset}: {}", .failures.len(), join_failures(.failures))]
    Handlers {
        topic: String,
        partition: i32,
        offset: i64,
        failures: Vec<HandlerFailure>,
    },

    /// The offset commit failed; the message will be redelivered after restart.
    #[error("Offset commit failed for {topic}[{partition}]@{offset} ({handler_failures} handler failure(s)): {source}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        handler_failures: usize,
        #[source]
        source: BrokerError,
    },
}

fn join_failures(failures: &[HandlerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
