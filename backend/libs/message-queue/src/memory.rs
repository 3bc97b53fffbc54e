//! In-process broker implementing the client traits.
//!
//! Every topic has a single partition (0). Records written inside a
//! transaction stay invisible until it commits; aborted records are skipped and
//! an open transaction blocks readers at its first record, as read-committed
//! consumers behave against the last stable offset. Committed offsets are kept
//! per consumer group, so a new consumer of a group resumes where the previous
//! one committed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{BrokerConsumer, BrokerError, InboundMessage, Record, TransactionalProducer};
use crate::config::OffsetReset;

const PARTITION: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordStatus {
    Pending(u64),
    Committed,
    Aborted,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Arc<[u8]>>,
    payload: Arc<[u8]>,
    status: RecordStatus,
}

#[derive(Default)]
struct Faults {
    send: usize,
    transaction_commit: usize,
    offset_commit: usize,
    join: usize,
}

fn take_fault(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

struct BrokerState {
    logs: HashMap<String, Vec<StoredRecord>>,
    /// (group, topic) -> next offset to consume
    committed: HashMap<(String, String), i64>,
    offset_commits: usize,
    joins: HashMap<String, usize>,
    polls: usize,
    available: bool,
    next_transaction: u64,
    faults: Faults,
}

struct Inner {
    state: Mutex<BrokerState>,
    changed: Notify,
}

/// Shared handle to the in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState {
                    logs: HashMap::new(),
                    committed: HashMap::new(),
                    offset_commits: 0,
                    joins: HashMap::new(),
                    polls: 0,
                    available: true,
                    next_transaction: 1,
                    faults: Faults::default(),
                }),
                changed: Notify::new(),
            }),
        }
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
            transaction: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn consumer(&self, group: impl Into<String>, reset: OffsetReset) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            group: group.into(),
            reset,
            positions: Mutex::new(BTreeMap::new()),
            cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a committed record outside any transaction; returns its offset.
    pub fn append(&self, topic: &str, payload: &[u8]) -> i64 {
        let offset = {
            let mut state = self.inner.state.lock();
            let log = state.logs.entry(topic.to_string()).or_default();
            log.push(StoredRecord {
                key: None,
                payload: Arc::from(payload),
                status: RecordStatus::Committed,
            });
            (log.len() - 1) as i64
        };
        self.inner.changed.notify_waiters();
        offset
    }

    /// Simulate a total outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.state.lock().available = available;
        self.inner.changed.notify_waiters();
    }

    pub fn fail_next_send(&self) {
        self.inner.state.lock().faults.send += 1;
    }

    pub fn fail_next_transaction_commit(&self) {
        self.inner.state.lock().faults.transaction_commit += 1;
    }

    pub fn fail_next_offset_commit(&self) {
        self.inner.state.lock().faults.offset_commit += 1;
    }

    pub fn fail_next_join(&self) {
        self.inner.state.lock().faults.join += 1;
    }

    /// Payloads a read-committed reader can see on `topic`, in offset order.
    pub fn visible_records(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .logs
            .get(topic)
            .map(|log| {
                log.iter()
                    .filter(|r| r.status == RecordStatus::Committed)
                    .map(|r| r.payload.to_vec())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of records ever written to `topic`, whatever their status.
    pub fn log_len(&self, topic: &str) -> usize {
        self.inner.state.lock().logs.get(topic).map_or(0, Vec::len)
    }

    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<i64> {
        self.inner
            .state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    pub fn offset_commit_count(&self) -> usize {
        self.inner.state.lock().offset_commits
    }

    pub fn join_count(&self, group: &str) -> usize {
        self.inner.state.lock().joins.get(group).copied().unwrap_or(0)
    }

    pub fn poll_count(&self) -> usize {
        self.inner.state.lock().polls
    }

    fn finish_transaction(&self, entries: &[(String, usize)], status: RecordStatus) {
        {
            let mut state = self.inner.state.lock();
            for (topic, index) in entries {
                if let Some(record) = state.logs.get_mut(topic).and_then(|log| log.get_mut(*index)) {
                    record.status = status;
                }
            }
        }
        self.inner.changed.notify_waiters();
    }
}

struct OpenTransaction {
    id: u64,
    entries: Vec<(String, usize)>,
}

/// Transactional producer over a [`MemoryBroker`].
pub struct MemoryProducer {
    broker: MemoryBroker,
    transaction: Mutex<Option<OpenTransaction>>,
    closed: AtomicBool,
}

impl MemoryProducer {
    fn ensure_usable(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if !self.broker.inner.state.lock().available {
            return Err(BrokerError::AllBrokersDown("memory broker unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionalProducer for MemoryProducer {
    async fn begin(&self) -> Result<(), BrokerError> {
        self.ensure_usable()?;
        let mut transaction = self.transaction.lock();
        if transaction.is_some() {
            return Err(BrokerError::Transaction(
                "transaction already in progress".to_string(),
            ));
        }
        let id = {
            let mut state = self.broker.inner.state.lock();
            state.next_transaction += 1;
            state.next_transaction
        };
        *transaction = Some(OpenTransaction {
            id,
            entries: Vec::new(),
        });
        Ok(())
    }

    async fn send(&self, record: Record) -> Result<(), BrokerError> {
        self.ensure_usable()?;
        let mut transaction = self.transaction.lock();
        let open = transaction
            .as_mut()
            .ok_or_else(|| BrokerError::Transaction("no open transaction".to_string()))?;

        let mut state = self.broker.inner.state.lock();
        if take_fault(&mut state.faults.send) {
            return Err(BrokerError::Produce("injected send failure".to_string()));
        }
        let log = state.logs.entry(record.topic.clone()).or_default();
        log.push(StoredRecord {
            key: record.key.map(Arc::from),
            payload: Arc::from(record.payload),
            status: RecordStatus::Pending(open.id),
        });
        open.entries.push((record.topic, log.len() - 1));
        Ok(())
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        let entries = {
            let mut transaction = self.transaction.lock();
            if transaction.is_none() {
                return Err(BrokerError::Transaction("no open transaction".to_string()));
            }
            if take_fault(&mut self.broker.inner.state.lock().faults.transaction_commit) {
                return Err(BrokerError::Transaction(
                    "injected transaction commit failure".to_string(),
                ));
            }
            transaction.take().map(|t| t.entries).unwrap_or_default()
        };
        self.broker
            .finish_transaction(&entries, RecordStatus::Committed);
        Ok(())
    }

    async fn abort(&self) -> Result<(), BrokerError> {
        let open = self
            .transaction
            .lock()
            .take()
            .ok_or_else(|| BrokerError::Transaction("no open transaction".to_string()))?;
        self.broker
            .finish_transaction(&open.entries, RecordStatus::Aborted);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        self.ensure_usable()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(open) = self.transaction.lock().take() {
            self.broker
                .finish_transaction(&open.entries, RecordStatus::Aborted);
        }
        Ok(())
    }
}

/// Consumer group member over a [`MemoryBroker`].
pub struct MemoryConsumer {
    broker: MemoryBroker,
    group: String,
    reset: OffsetReset,
    /// topic -> next offset to fetch
    positions: Mutex<BTreeMap<String, i64>>,
    cursor: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryConsumer {
    pub fn group(&self) -> &str {
        &self.group
    }

    fn ensure_usable(&self, state: &BrokerState) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if !state.available {
            return Err(BrokerError::AllBrokersDown("memory broker unavailable".to_string()));
        }
        Ok(())
    }

    /// Next visible record across joined topics, rotating the starting topic.
    fn fetch(&self, state: &BrokerState) -> Option<InboundMessage> {
        let mut positions = self.positions.lock();
        if positions.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % positions.len();
        let topics: Vec<String> = positions.keys().cloned().collect();

        for topic in topics.iter().cycle().skip(start).take(topics.len()) {
            let Some(log) = state.logs.get(topic) else {
                continue;
            };
            let Some(position) = positions.get_mut(topic) else {
                continue;
            };
            while let Some(record) = log.get(*position as usize) {
                match record.status {
                    RecordStatus::Aborted => *position += 1,
                    RecordStatus::Pending(_) => break,
                    RecordStatus::Committed => {
                        let message = InboundMessage {
                            topic: topic.clone(),
                            partition: PARTITION,
                            offset: *position,
                            key: record.key.clone(),
                            payload: Arc::clone(&record.payload),
                        };
                        *position += 1;
                        return Some(message);
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    fn join(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.inner.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if take_fault(&mut state.faults.join) {
            return Err(BrokerError::Subscribe("injected join failure".to_string()));
        }
        *state.joins.entry(self.group.clone()).or_default() += 1;

        let start = match state
            .committed
            .get(&(self.group.clone(), topic.to_string()))
        {
            Some(offset) => *offset,
            None => match self.reset {
                OffsetReset::Earliest => 0,
                OffsetReset::Latest => state.logs.get(topic).map_or(0, Vec::len) as i64,
            },
        };
        self.positions
            .lock()
            .entry(topic.to_string())
            .or_insert(start);
        Ok(())
    }

    async fn poll(&self, max_wait: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        let deadline = Instant::now() + max_wait;
        self.broker.inner.state.lock().polls += 1;

        loop {
            let changed = self.broker.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let state = self.broker.inner.state.lock();
                self.ensure_usable(&state)?;
                if let Some(message) = self.fetch(&state) {
                    return Ok(Some(message));
                }
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        let mut state = self.broker.inner.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if take_fault(&mut state.faults.offset_commit) {
            return Err(BrokerError::Commit("injected offset commit failure".to_string()));
        }
        state.committed.insert(
            (self.group.clone(), message.topic.clone()),
            message.offset + 1,
        );
        state.offset_commits += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
