use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{
    Broker, BrokerMessage, KeyKind, KeyTtl, KeyValueStore, StoreError, Subscription,
    SubscriptionHandle,
};
use crate::clock::SharedClock;

const SUBSCRIPTION_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum StoredValue {
    String(String),
    Set(HashSet<String>),
    SortedSet(HashMap<String, f64>),
    Hash(HashMap<String, String>),
}

impl StoredValue {
    fn kind(&self) -> KeyKind {
        match self {
            Self::String(_) => KeyKind::String,
            Self::Set(_) => KeyKind::Set,
            Self::SortedSet(_) => KeyKind::SortedSet,
            Self::Hash(_) => KeyKind::Hash,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::String(_) => false,
            Self::Set(members) => members.is_empty(),
            Self::SortedSet(members) => members.is_empty(),
            Self::Hash(fields) => fields.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn new(value: StoredValue) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct ChannelSubscriber {
    id: u64,
    tx: mpsc::Sender<BrokerMessage>,
}

type ChannelRegistry = Arc<DashMap<String, Vec<ChannelSubscriber>>>;

struct MemorySubscriptionHandle {
    id: u64,
    channels: Vec<String>,
    registry: ChannelRegistry,
}

impl SubscriptionHandle for MemorySubscriptionHandle {
    fn release(&self) {
        for channel in &self.channels {
            if let Some(mut subscribers) = self.registry.get_mut(channel) {
                subscribers.retain(|s| s.id != self.id);
            }
            self.registry.remove_if(channel, |_, subscribers| subscribers.is_empty());
        }
    }
}

/// In-process shared store: pub/sub channels plus typed keys with expiry.
///
/// Expired keys are dropped lazily on access, measured against the injected
/// clock.
pub struct MemoryStore {
    clock: SharedClock,
    keys: DashMap<String, StoredEntry>,
    channels: ChannelRegistry,
    next_subscription: AtomicU64,
    subscription_capacity: usize,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_subscription_capacity(clock, SUBSCRIPTION_CAPACITY)
    }

    pub fn with_subscription_capacity(clock: SharedClock, capacity: usize) -> Self {
        Self {
            clock,
            keys: DashMap::new(),
            channels: Arc::new(DashMap::new()),
            next_subscription: AtomicU64::new(1),
            subscription_capacity: capacity.max(1),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every operation fails until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store disabled".to_string()))
        }
    }

    fn purge_expired(&self, key: &str) {
        let now = self.clock.now();
        self.keys.remove_if(key, |_, entry| entry.is_expired(now));
    }

    fn remove_if_empty(&self, key: &str) {
        self.keys.remove_if(key, |_, entry| entry.value.is_empty());
    }

    fn prepare(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.purge_expired(key);
        Ok(())
    }
}

fn wrong_kind(key: &str, expected: KeyKind, found: KeyKind) -> StoreError {
    StoreError::WrongKind {
        key: key.to_string(),
        expected,
        found,
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[async_trait]
impl Broker for MemoryStore {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        self.check_available()?;
        let Some(mut subscribers) = self.channels.get_mut(channel) else {
            return Ok(0);
        };
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            let message = BrokerMessage {
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            match subscriber.tx.try_send(message) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "subscription {} lagging on {channel}, dropped message",
                        subscriber.id
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, StoreError> {
        self.check_available()?;
        let mut unique = channels.to_vec();
        unique.sort();
        unique.dedup();

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.subscription_capacity);
        for channel in &unique {
            self.channels
                .entry(channel.clone())
                .or_default()
                .push(ChannelSubscriber { id, tx: tx.clone() });
        }

        let handle = MemorySubscriptionHandle {
            id,
            channels: unique.clone(),
            registry: self.channels.clone(),
        };
        Ok(Subscription::new(unique, rx, Box::new(handle)))
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self
            .channels
            .get(channel)
            .map(|subscribers| subscribers.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn kind(&self, key: &str) -> Result<Option<KeyKind>, StoreError> {
        self.prepare(key)?;
        Ok(self.keys.get(key).map(|entry| entry.value.kind()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.prepare(key)?;
        Ok(self.keys.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.prepare(key)?;
        let now = self.clock.now();
        let Some(mut entry) = self.keys.get_mut(key) else {
            return Ok(false);
        };
        entry.expires_at = Some(now + chrono_ttl(ttl));
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        self.prepare(key)?;
        let now = self.clock.now();
        let Some(entry) = self.keys.get(key) else {
            return Ok(KeyTtl::Missing);
        };
        Ok(match entry.expires_at {
            None => KeyTtl::Persistent,
            Some(at) => KeyTtl::Expires((at - now).to_std().unwrap_or(Duration::ZERO)),
        })
    }

    async fn string_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.prepare(key)?;
        self.keys.insert(
            key.to_string(),
            StoredEntry::new(StoredValue::String(value.to_string())),
        );
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        self.prepare(key)?;
        let now = self.clock.now();
        let mut entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(StoredValue::String("0".to_string())));
        let found = entry.value.kind();
        let StoredValue::String(raw) = &mut entry.value else {
            return Err(wrong_kind(key, KeyKind::String, found));
        };
        let current: i64 = raw.parse().map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("not an integer: {raw}"),
        })?;
        let next = current + 1;
        *raw = next.to_string();
        if next == 1 {
            entry.expires_at = Some(now + chrono_ttl(window));
        }
        Ok(next)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.prepare(key)?;
        let mut entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(StoredValue::Set(HashSet::new())));
        match &mut entry.value {
            StoredValue::Set(members) => Ok(members.insert(member.to_string())),
            other => Err(wrong_kind(key, KeyKind::Set, other.kind())),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.prepare(key)?;
        let Some(entry) = self.keys.get(key) else {
            return Ok(Vec::new());
        };
        match &entry.value {
            StoredValue::Set(members) => {
                let mut members: Vec<String> = members.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            other => Err(wrong_kind(key, KeyKind::Set, other.kind())),
        }
    }

    async fn sorted_set_upsert(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.prepare(key)?;
        let mut entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(StoredValue::SortedSet(HashMap::new())));
        match &mut entry.value {
            StoredValue::SortedSet(members) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            other => Err(wrong_kind(key, KeyKind::SortedSet, other.kind())),
        }
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.prepare(key)?;
        let Some(entry) = self.keys.get(key) else {
            return Ok(None);
        };
        match &entry.value {
            StoredValue::SortedSet(members) => Ok(members.get(member).copied()),
            other => Err(wrong_kind(key, KeyKind::SortedSet, other.kind())),
        }
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.prepare(key)?;
        let removed = {
            let Some(mut entry) = self.keys.get_mut(key) else {
                return Ok(false);
            };
            match &mut entry.value {
                StoredValue::SortedSet(members) => members.remove(member).is_some(),
                other => return Err(wrong_kind(key, KeyKind::SortedSet, other.kind())),
            }
        };
        self.remove_if_empty(key);
        Ok(removed)
    }

    async fn sorted_set_entries(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        self.prepare(key)?;
        let Some(entry) = self.keys.get(key) else {
            return Ok(Vec::new());
        };
        match &entry.value {
            StoredValue::SortedSet(members) => {
                let mut entries: Vec<(String, f64)> =
                    members.iter().map(|(m, s)| (m.clone(), *s)).collect();
                entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(entries)
            }
            other => Err(wrong_kind(key, KeyKind::SortedSet, other.kind())),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.prepare(key)?;
        let mut entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(StoredValue::Hash(HashMap::new())));
        match &mut entry.value {
            StoredValue::Hash(fields) => {
                fields.insert(field.to_string(), value.to_string());
                Ok(())
            }
            other => Err(wrong_kind(key, KeyKind::Hash, other.kind())),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.prepare(key)?;
        let Some(entry) = self.keys.get(key) else {
            return Ok(None);
        };
        match &entry.value {
            StoredValue::Hash(fields) => Ok(fields.get(field).cloned()),
            other => Err(wrong_kind(key, KeyKind::Hash, other.kind())),
        }
    }

    async fn hash_remove(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.prepare(key)?;
        let removed = {
            let Some(mut entry) = self.keys.get_mut(key) else {
                return Ok(false);
            };
            match &mut entry.value {
                StoredValue::Hash(fields) => fields.remove(field).is_some(),
                other => return Err(wrong_kind(key, KeyKind::Hash, other.kind())),
            }
        };
        self.remove_if_empty(key);
        Ok(removed)
    }

    async fn hash_add_float_if_present(
        &self,
        key: &str,
        field: &str,
        delta: f64,
    ) -> Result<Option<f64>, StoreError> {
        self.prepare(key)?;
        let Some(mut entry) = self.keys.get_mut(key) else {
            return Ok(None);
        };
        let found = entry.value.kind();
        let StoredValue::Hash(fields) = &mut entry.value else {
            return Err(wrong_kind(key, KeyKind::Hash, found));
        };
        let Some(raw) = fields.get_mut(field) else {
            return Ok(None);
        };
        let current: f64 = raw.parse().map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("field {field} is not numeric: {raw}"),
        })?;
        let next = current + delta;
        *raw = next.to_string();
        Ok(Some(next))
    }
}
