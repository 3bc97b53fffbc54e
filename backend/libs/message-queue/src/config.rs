//! Queue configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::error::{QueueError, QueueResult};

/// Broker client and worker pool settings for one queue (one consumer group).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct QueueConfig {
    /// Bootstrap servers
    #[validate(length(min = 1))]
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    /// Consumer group ID
    #[validate(length(min = 1, max = 255))]
    pub group_id: String,

    /// Client ID
    #[validate(length(min = 1, max = 255))]
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Stable transactional identity of the producer. Defaults to `<group_id>-producer`.
    #[serde(default)]
    pub transactional_id: Option<String>,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Consumer session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Transaction timeout in milliseconds
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,

    /// Fetch min bytes
    #[validate(range(min = 1))]
    #[serde(default = "default_fetch_min_bytes")]
    pub fetch_min_bytes: u32,

    /// Fetch max bytes
    #[validate(range(min = 1024))]
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: u32,

    /// Upper bound of a single poll in milliseconds
    #[validate(range(min = 1, max = 60000))]
    #[serde(default = "default_max_poll_wait_ms")]
    pub max_poll_wait_ms: u64,

    /// Producer linger time in milliseconds
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,

    /// Producer retries
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// In-flight requests per connection (idempotence requires at most 5)
    #[validate(range(min = 1, max = 5))]
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,

    /// Where a group without committed offsets starts
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,

    /// Number of dispatch workers
    #[validate(range(min = 1, max = 1024))]
    #[serde(default = "default_worker_capacity")]
    pub worker_capacity: usize,

    /// Bounded work queue between the poll loop and the workers
    #[validate(range(min = 1))]
    #[serde(default = "default_worker_queue_size")]
    pub worker_queue_size: usize,

    /// Deadline shared by all handlers of one message, in milliseconds
    #[validate(range(min = 1))]
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// Pause of the poll loop after an all-brokers-down error, in milliseconds
    #[serde(default = "default_outage_backoff_ms")]
    pub outage_backoff_ms: u64,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_client_id() -> String {
    "message-queue".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_transaction_timeout_ms() -> u64 {
    60000
}

fn default_fetch_min_bytes() -> u32 {
    1
}

fn default_fetch_max_bytes() -> u32 {
    52428800 // 50MB
}

fn default_max_poll_wait_ms() -> u64 {
    100
}

fn default_linger_ms() -> u64 {
    5
}

fn default_retries() -> u32 {
    5
}

fn default_max_in_flight() -> u32 {
    5
}

fn default_worker_capacity() -> usize {
    8
}

fn default_worker_queue_size() -> usize {
    100
}

fn default_handler_timeout_ms() -> u64 {
    30000
}

fn default_outage_backoff_ms() -> u64 {
    5000
}

/// Offset reset strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from earliest offset
    Earliest,
    /// Start from latest offset
    #[default]
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl QueueConfig {
    /// Config with every default and the given consumer group.
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            brokers: default_brokers(),
            group_id: group_id.into(),
            client_id: default_client_id(),
            transactional_id: None,
            request_timeout_ms: default_request_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            fetch_min_bytes: default_fetch_min_bytes(),
            fetch_max_bytes: default_fetch_max_bytes(),
            max_poll_wait_ms: default_max_poll_wait_ms(),
            linger_ms: default_linger_ms(),
            retries: default_retries(),
            max_in_flight: default_max_in_flight(),
            auto_offset_reset: OffsetReset::default(),
            worker_capacity: default_worker_capacity(),
            worker_queue_size: default_worker_queue_size(),
            handler_timeout_ms: default_handler_timeout_ms(),
            outage_backoff_ms: default_outage_backoff_ms(),
        }
    }

    /// Load from `MQ_*` environment variables (after reading `.env` if present).
    ///
    /// `MQ_BROKERS` is comma-separated; `MQ_GROUP_ID` is required.
    pub fn from_env() -> QueueResult<Self> {
        dotenvy::dotenv().ok();
        let config: QueueConfig = envy::prefixed("MQ_")
            .from_env()
            .map_err(|e| QueueError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Run field validation, mapping failures to [`QueueError::Config`].
    pub fn check(&self) -> QueueResult<()> {
        self.validate()
            .map_err(|e| QueueError::Config(e.to_string()))
    }

    /// Get bootstrap servers as comma-separated string
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn transactional_id(&self) -> String {
        self.transactional_id
            .clone()
            .unwrap_or_else(|| format!("{}-producer", self.group_id))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn max_poll_wait(&self) -> Duration {
        Duration::from_millis(self.max_poll_wait_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn outage_backoff(&self) -> Duration {
        Duration::from_millis(self.outage_backoff_ms)
    }
}
