//! Topic → handlers map shared by the dispatch workers.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::InboundMessage;
use crate::context::Context;

/// A registered message handler.
pub type Handler =
    Arc<dyn Fn(Context, InboundMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Registration-ordered handlers per topic. Grows only; there is no unsubscribe.
#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: RwLock<HashMap<String, Vec<Handler>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to `topic`.
    ///
    /// For the first handler of a topic `on_first` runs while the write lock is
    /// held; if it fails nothing is registered. Returns whether the topic is new.
    pub fn register<E>(
        &self,
        topic: &str,
        handler: Handler,
        on_first: impl FnOnce() -> Result<(), E>,
    ) -> Result<bool, E> {
        let mut topics = self.topics.write();
        match topics.get_mut(topic) {
            Some(handlers) => {
                handlers.push(handler);
                Ok(false)
            }
            None => {
                on_first()?;
                topics.insert(topic.to_string(), vec![handler]);
                Ok(true)
            }
        }
    }

    /// Snapshot of the handlers currently registered for `topic`.
    pub fn handlers(&self, topic: &str) -> Vec<Handler> {
        self.topics
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }
}
