//! Shared-store seams.
//!
//! Everything that has to be visible across stream tasks and producers lives
//! behind these two traits: [`Broker`] for fire-and-forget pub/sub and
//! [`KeyValueStore`] for the presence structures and rate-limit counters.
//! Every operation is a single-key atomic step, so callers never need an
//! in-process lock around them.
//!
//! [`MemoryStore`] implements both for single-process deployments and tests.

mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("wrong value kind at {key}: expected {expected}, found {found}")]
    WrongKind {
        key: String,
        expected: KeyKind,
        found: KeyKind,
    },
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Shape of the value stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    String,
    Set,
    SortedSet,
    Hash,
}

impl KeyKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Set => "set",
            Self::SortedSet => "zset",
            Self::Hash => "hash",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// Releases a subscription's registration with its broker.
pub trait SubscriptionHandle: Send + Sync {
    fn release(&self);
}

/// A live registration on one or more channels.
///
/// Dropping it unsubscribes, so the registration cannot outlive the task
/// that owns it.
pub struct Subscription {
    channels: Vec<String>,
    rx: mpsc::Receiver<BrokerMessage>,
    handle: Option<Box<dyn SubscriptionHandle>>,
}

impl Subscription {
    pub fn new(
        channels: Vec<String>,
        rx: mpsc::Receiver<BrokerMessage>,
        handle: Box<dyn SubscriptionHandle>,
    ) -> Self {
        Self {
            channels,
            rx,
            handle: Some(handle),
        }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Next message, or `None` once unsubscribed or the broker has gone away.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        if self.handle.is_none() {
            return None;
        }
        self.rx.recv().await
    }

    /// Safe to call more than once; only the first call releases.
    pub fn unsubscribe(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
            self.rx.close();
            tracing::debug!("unsubscribed from {} channels", self.channels.len());
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channels", &self.channels)
            .field("active", &self.is_active())
            .finish()
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish to a channel, returning how many subscriptions received it.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError>;

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, StoreError>;

    /// Number of live subscriptions on a channel.
    async fn subscriber_count(&self, channel: &str) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn kind(&self, key: &str) -> Result<Option<KeyKind>, StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    async fn string_set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Increment a counter, setting `window` as its expiry only when the
    /// increment created it.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn sorted_set_upsert(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;
    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;
    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    /// Members ordered by ascending score.
    async fn sorted_set_entries(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hash_remove(&self, key: &str, field: &str) -> Result<bool, StoreError>;
    /// Add `delta` to a numeric field. Returns `None` without creating
    /// anything when the field is absent.
    async fn hash_add_float_if_present(
        &self,
        key: &str,
        field: &str,
        delta: f64,
    ) -> Result<Option<f64>, StoreError>;
}
