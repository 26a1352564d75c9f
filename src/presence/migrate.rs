//! Reconciles a session's waiting structure with the current storage shape.
//!
//! Older deployments kept waiting peers in a plain set with only a key-level
//! TTL. Before writing a heartbeat the key is inspected and, if it has any
//! other shape, rebuilt as a score-ordered structure with its remaining TTL
//! carried over. Failure to migrate resets the key instead of failing the
//! caller.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::unix_seconds;
use crate::store::{KeyKind, KeyTtl, KeyValueStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Current,
    Migrated { members: usize },
    Reset,
    Unknown,
}

pub async fn reconcile_waiting_shape(
    store: &dyn KeyValueStore,
    key: &str,
    full_ttl: Duration,
    now: DateTime<Utc>,
) -> Reconciliation {
    let kind = match store.kind(key).await {
        Ok(kind) => kind,
        Err(e) => {
            tracing::warn!("could not inspect {key}: {e}");
            return Reconciliation::Unknown;
        }
    };

    let found = match kind {
        None | Some(KeyKind::SortedSet) => return Reconciliation::Current,
        Some(found) => found,
    };

    match migrate(store, key, found, full_ttl, now).await {
        Ok(members) => {
            tracing::info!("migrated {key} from {found} to zset ({members} members)");
            Reconciliation::Migrated { members }
        }
        Err(e) => {
            tracing::warn!("could not migrate {key} from {found}: {e}; resetting");
            if let Err(e) = store.delete(key).await {
                tracing::warn!("could not reset {key}: {e}");
                return Reconciliation::Unknown;
            }
            Reconciliation::Reset
        }
    }
}

async fn migrate(
    store: &dyn KeyValueStore,
    key: &str,
    found: KeyKind,
    full_ttl: Duration,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let ttl = store.ttl(key).await?;
    let members = match found {
        KeyKind::Set => store.set_members(key).await?,
        _ => Vec::new(),
    };
    store.delete(key).await?;
    if members.is_empty() {
        return Ok(0);
    }

    // Members carry no heartbeat of their own. Date them to the last time the
    // key's TTL was refreshed so migration never makes a peer look fresher.
    let elapsed = match ttl {
        KeyTtl::Expires(remaining) => full_ttl.saturating_sub(remaining),
        KeyTtl::Persistent | KeyTtl::Missing => full_ttl,
    };
    let elapsed = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
    let score = unix_seconds(now - elapsed);

    for member in &members {
        store.sorted_set_upsert(key, member, score).await?;
    }
    if let KeyTtl::Expires(remaining) = ttl {
        store.expire(key, remaining).await?;
    }
    Ok(members.len())
}
