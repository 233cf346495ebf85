use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use weft_core::error::Result;
use weft_core::topic::TopicPattern;
pub use weft_core::types::Backoff;

use crate::entry::EventLogEntry;

/// Subscriber callback.
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one delivered event. An error triggers the subscription's retry policy.
    fn handle(&self, event: EventLogEntry) -> BoxFuture<'_, Result<()>>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a subscriber callback.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventLogEntry) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventLogEntry) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, event: EventLogEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin((self.0)(event))
    }
}

/// Acknowledgment mode. `Manual` is accepted but delivery stays caller-driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    #[default]
    Auto,
    Manual,
}

/// Predicate applied to candidate events.
pub type EventFilter = Arc<dyn Fn(&EventLogEntry) -> bool + Send + Sync>;

/// Options for [`crate::EventBus::subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub partition: Option<usize>,
    /// Replay past events from this offset before returning.
    pub start_offset: Option<u64>,
    /// Inclusive upper bound for the replay pass.
    pub end_offset: Option<u64>,
    pub filter: Option<EventFilter>,
    pub ack_mode: AckMode,
    /// Falls back to the bus default when unset.
    pub max_retries: Option<u32>,
    /// Falls back to the bus default when unset.
    pub retry_delay: Option<Duration>,
    pub backoff: Backoff,
    pub dead_letter_topic: Option<String>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_offset(mut self, offset: u64) -> Self {
        self.start_offset = Some(offset);
        self
    }

    pub fn until_offset(mut self, offset: u64) -> Self {
        self.end_offset = Some(offset);
        self
    }

    pub fn partition(mut self, partition: usize) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn filter(mut self, f: impl Fn(&EventLogEntry) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn retries(mut self, max_retries: u32, delay: Duration, backoff: Backoff) -> Self {
        self.max_retries = Some(max_retries);
        self.retry_delay = Some(delay);
        self.backoff = backoff;
        self
    }

    pub fn dead_letter(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("partition", &self.partition)
            .field("start_offset", &self.start_offset)
            .field("end_offset", &self.end_offset)
            .field("filter", &self.filter.is_some())
            .field("ack_mode", &self.ack_mode)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("backoff", &self.backoff)
            .field("dead_letter_topic", &self.dead_letter_topic)
            .finish()
    }
}

/// Delivery counters for one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub delivered: u64,
    pub failed_attempts: u64,
    pub dead_lettered: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    pub(crate) fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SubscriptionStats {
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// A registered subscription.
pub(crate) struct Subscription {
    pub id: String,
    pub subscriber_id: String,
    pub pattern: TopicPattern,
    pub partition: Option<usize>,
    pub filter: Option<EventFilter>,
    #[allow(dead_code)]
    pub ack_mode: AckMode,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff: Backoff,
    pub dead_letter_topic: Option<String>,
    pub handler: Arc<dyn EventHandler>,
    /// Cleared on unsubscribe; queued deliveries and retries check it.
    pub active: AtomicBool,
    pub counters: Counters,
}

impl Subscription {
    /// Topic, partition and predicate all accept the event.
    pub fn accepts(&self, event: &EventLogEntry) -> bool {
        self.pattern.matches(&event.topic)
            && self.partition.map_or(true, |p| p == event.partition)
            && self.filter.as_ref().map_or(true, |f| f(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let opts = SubscribeOptions::new()
            .from_offset(0)
            .until_offset(9)
            .partition(1)
            .retries(5, Duration::from_millis(10), Backoff::Linear)
            .dead_letter("dlq.orders");
        assert_eq!(opts.start_offset, Some(0));
        assert_eq!(opts.end_offset, Some(9));
        assert_eq!(opts.partition, Some(1));
        assert_eq!(opts.max_retries, Some(5));
        assert_eq!(opts.backoff, Backoff::Linear);
        assert_eq!(opts.dead_letter_topic.as_deref(), Some("dlq.orders"));
    }
}
