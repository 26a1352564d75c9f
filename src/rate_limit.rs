//! Fixed-window request limiting on the shared store.
//!
//! The window starts at a client's first request and is not sliding, so a
//! burst straddling a window boundary can reach twice the limit.

use std::sync::Arc;
use std::time::Duration;

use crate::config::HubConfig;
use crate::store::{KeyTtl, KeyValueStore, StoreError};

pub const INIT_KEY_PREFIX: &str = "ratelimit:init";

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Count one request from `client`. Returns `None` while within `limit`,
    /// otherwise the number of seconds until the window resets.
    ///
    /// Store failures are returned as errors; callers should refuse the
    /// request rather than let it through unchecked.
    pub async fn check(
        &self,
        key_prefix: &str,
        client: &str,
        limit: u32,
        window: Duration,
    ) -> Result<Option<u64>, StoreError> {
        let key = format!("{key_prefix}:{client}");
        let current = self.store.incr_with_expiry(&key, window).await?;
        if current <= i64::from(limit) {
            return Ok(None);
        }

        let retry_after = match self.store.ttl(&key).await? {
            KeyTtl::Expires(remaining) => remaining.as_secs_f64().ceil() as u64,
            KeyTtl::Persistent | KeyTtl::Missing => {
                self.store.delete(&key).await?;
                tracing::error!("rate limit key without TTL deleted: client={client} key={key}");
                window.as_secs()
            }
        };
        tracing::warn!(
            "rate limit exceeded: client={client} key={key} count={current} limit={limit}"
        );
        Ok(Some(retry_after))
    }

    /// Limit applied to workspace registration.
    pub async fn check_init(
        &self,
        client: &str,
        config: &HubConfig,
    ) -> Result<Option<u64>, StoreError> {
        self.check(
            INIT_KEY_PREFIX,
            client,
            config.init_rate_limit,
            config.init_rate_window(),
        )
        .await
    }
}
