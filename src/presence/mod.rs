//! Presence and wait-deadline tracking for chat sessions.
//!
//! Each session has two keys in the shared store:
//! - `chat:waiting:<session>`: peer -> last heartbeat (unix seconds), score
//!   ordered, with a key-level TTL of three keepalive intervals.
//! - `chat:deadline:<session>`: peer -> absolute wait deadline, expired on
//!   the same schedule.
//!
//! A peer counts as waiting only while the key exists *and* its own
//! heartbeat is younger than the caller's max age. The per-peer check keeps
//! one peer's refreshes from keeping every other peer alive.

pub mod migrate;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::bus::{deadline_key, waiting_key};
use crate::clock::{from_unix_seconds, unix_seconds, SharedClock};
use crate::store::{KeyValueStore, StoreError};

#[derive(Clone)]
pub struct WaitingTracker {
    store: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    keepalive: Duration,
}

impl WaitingTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: SharedClock, keepalive: Duration) -> Self {
        Self {
            store,
            clock,
            keepalive,
        }
    }

    pub fn keepalive(&self) -> Duration {
        self.keepalive
    }

    /// Tolerates two missed heartbeats before the whole structure lapses.
    pub fn structure_ttl(&self) -> Duration {
        self.keepalive * 3
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn mark_waiting(&self, session_id: &str, peer_id: &str) -> Result<(), StoreError> {
        let key = waiting_key(session_id);
        let now = self.clock.now();
        migrate::reconcile_waiting_shape(self.store.as_ref(), &key, self.structure_ttl(), now)
            .await;

        self.store
            .sorted_set_upsert(&key, peer_id, unix_seconds(now))
            .await?;
        self.store.expire(&key, self.structure_ttl()).await?;
        self.store
            .expire(&deadline_key(session_id), self.structure_ttl())
            .await?;
        Ok(())
    }

    /// Mark the peer waiting and, when the wait has a known timeout, record
    /// its deadline.
    pub async fn begin_wait(
        &self,
        session_id: &str,
        peer_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.mark_waiting(session_id, peer_id).await?;
        let Some(timeout) = timeout else {
            return Ok(None);
        };
        let deadline = self.clock.now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        self.set_deadline(session_id, peer_id, deadline).await?;
        Ok(Some(deadline))
    }

    /// True only if the peer has a heartbeat no older than `max_age`. A stale
    /// entry is removed, together with its deadline, as part of the check.
    pub async fn is_waiting(
        &self,
        session_id: &str,
        peer_id: &str,
        max_age: Duration,
    ) -> Result<bool, StoreError> {
        let key = waiting_key(session_id);
        let heartbeat = match self.store.sorted_set_score(&key, peer_id).await {
            Ok(score) => score,
            Err(StoreError::WrongKind { found, .. }) => {
                tracing::warn!("{key} has legacy shape {found}, treating {peer_id} as absent");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let Some(heartbeat) = heartbeat else {
            return Ok(false);
        };

        let age = unix_seconds(self.clock.now()) - heartbeat;
        if age <= max_age.as_secs_f64() {
            return Ok(true);
        }

        tracing::debug!("heartbeat for {peer_id} in {session_id} is {age:.0}s old, expiring");
        self.clear_waiting(session_id, peer_id).await?;
        Ok(false)
    }

    /// Fresh peers of a session, oldest heartbeat first. Stale peers found
    /// along the way are removed.
    pub async fn waiting_peers(
        &self,
        session_id: &str,
        max_age: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let key = waiting_key(session_id);
        let entries = match self.store.sorted_set_entries(&key).await {
            Ok(entries) => entries,
            Err(StoreError::WrongKind { found, .. }) => {
                tracing::warn!("{key} has legacy shape {found}, no peers reported");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let now = unix_seconds(self.clock.now());
        let mut fresh = Vec::with_capacity(entries.len());
        for (peer_id, heartbeat) in entries {
            if now - heartbeat <= max_age.as_secs_f64() {
                fresh.push(peer_id);
            } else {
                self.clear_waiting(session_id, &peer_id).await?;
            }
        }
        Ok(fresh)
    }

    /// Remove the peer's heartbeat and deadline. Safe to repeat.
    pub async fn clear_waiting(&self, session_id: &str, peer_id: &str) -> Result<(), StoreError> {
        let key = waiting_key(session_id);
        match self.store.sorted_set_remove(&key, peer_id).await {
            Ok(_) => {}
            Err(StoreError::WrongKind { .. }) => {
                self.store.delete(&key).await?;
            }
            Err(e) => return Err(e),
        }
        self.store
            .hash_remove(&deadline_key(session_id), peer_id)
            .await?;
        Ok(())
    }

    pub async fn set_deadline(
        &self,
        session_id: &str,
        peer_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = deadline_key(session_id);
        self.store
            .hash_set(&key, peer_id, &unix_seconds(deadline).to_string())
            .await?;
        self.store.expire(&key, self.structure_ttl()).await?;
        Ok(())
    }

    pub async fn get_deadline(
        &self,
        session_id: &str,
        peer_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let key = deadline_key(session_id);
        let Some(raw) = self.store.hash_get(&key, peer_id).await? else {
            return Ok(None);
        };
        let parsed = raw.parse::<f64>().ok().and_then(from_unix_seconds);
        if parsed.is_none() {
            tracing::warn!("ignoring unreadable deadline for {peer_id} in {key}: {raw}");
        }
        Ok(parsed)
    }

    /// Push an existing deadline back by `extra`. Adds to the stored value,
    /// so repeated extensions compose. Returns `None` when there is no
    /// deadline to extend.
    pub async fn extend_deadline(
        &self,
        session_id: &str,
        peer_id: &str,
        extra: Duration,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let key = deadline_key(session_id);
        let extended = self
            .store
            .hash_add_float_if_present(&key, peer_id, extra.as_secs_f64())
            .await?;
        Ok(extended.and_then(from_unix_seconds))
    }
}
