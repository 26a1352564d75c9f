//! Runtime configuration.
//!
//! Values come from `BEADHUB_*` environment variables (a `.env` file is
//! loaded first when present) layered over the defaults below.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub keepalive_seconds: u64,
    pub empty_stream_max_seconds: u64,
    pub waiting_max_age_seconds: u64,
    pub max_retry_attempts: u32,
    pub outbox_batch_limit: u32,
    pub outbox_error_max_len: usize,
    pub outbox_retention_days: u32,
    pub outbox_poll_interval_ms: u64,
    pub outbox_stale_claim_seconds: u64,
    pub init_rate_limit: u32,
    pub init_rate_window_seconds: u64,
    pub database_path: PathBuf,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            keepalive_seconds: 30,
            empty_stream_max_seconds: 300,
            waiting_max_age_seconds: 90,
            max_retry_attempts: 3,
            outbox_batch_limit: 100,
            outbox_error_max_len: 500,
            outbox_retention_days: 7,
            outbox_poll_interval_ms: 5000,
            outbox_stale_claim_seconds: 300,
            init_rate_limit: 10,
            init_rate_window_seconds: 60,
            database_path: PathBuf::from("beadhub-events.db"),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl HubConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_seconds)
    }

    pub fn empty_stream_max(&self) -> Duration {
        Duration::from_secs(self.empty_stream_max_seconds)
    }

    pub fn waiting_max_age(&self) -> Duration {
        Duration::from_secs(self.waiting_max_age_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.outbox_poll_interval_ms)
    }

    pub fn stale_claim_age(&self) -> Duration {
        Duration::from_secs(self.outbox_stale_claim_seconds)
    }

    pub fn init_rate_window(&self) -> Duration {
        Duration::from_secs(self.init_rate_window_seconds)
    }

    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        read(&lookup, "BEADHUB_KEEPALIVE_SECONDS", &mut config.keepalive_seconds, 1)?;
        read(
            &lookup,
            "BEADHUB_EMPTY_STREAM_MAX_SECONDS",
            &mut config.empty_stream_max_seconds,
            1,
        )?;
        read(
            &lookup,
            "BEADHUB_WAITING_MAX_AGE_SECONDS",
            &mut config.waiting_max_age_seconds,
            1,
        )?;
        read(&lookup, "BEADHUB_MAX_RETRY_ATTEMPTS", &mut config.max_retry_attempts, 1)?;
        read(&lookup, "BEADHUB_OUTBOX_BATCH_LIMIT", &mut config.outbox_batch_limit, 1)?;
        read(&lookup, "BEADHUB_OUTBOX_ERROR_MAX_LEN", &mut config.outbox_error_max_len, 1)?;
        read(&lookup, "BEADHUB_OUTBOX_RETENTION_DAYS", &mut config.outbox_retention_days, 0)?;
        read(
            &lookup,
            "BEADHUB_OUTBOX_POLL_INTERVAL_MS",
            &mut config.outbox_poll_interval_ms,
            1,
        )?;
        read(
            &lookup,
            "BEADHUB_OUTBOX_STALE_CLAIM_SECONDS",
            &mut config.outbox_stale_claim_seconds,
            1,
        )?;
        read(&lookup, "BEADHUB_INIT_RATE_LIMIT", &mut config.init_rate_limit, 1)?;
        read(
            &lookup,
            "BEADHUB_INIT_RATE_WINDOW_SECONDS",
            &mut config.init_rate_window_seconds,
            1,
        )?;

        if let Some(path) = lookup("BEADHUB_EVENTS_DB_PATH").filter(|p| !p.trim().is_empty()) {
            config.database_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("BEADHUB_LOG_LEVEL").filter(|l| !l.trim().is_empty()) {
            config.log_level = level.trim().to_lowercase();
        }
        if let Some(raw) = lookup("BEADHUB_LOG_JSON") {
            config.log_json = match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "BEADHUB_LOG_JSON",
                        expected: "a boolean".to_string(),
                        value: raw,
                    })
                }
            };
        }

        Ok(config)
    }
}

fn read<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    slot: &mut T,
    min: T,
) -> Result<(), ConfigError>
where
    T: FromStr + PartialOrd + std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(());
    };
    let invalid = || ConfigError::Invalid {
        var,
        expected: format!("an integer >= {min}"),
        value: raw.clone(),
    };
    let value: T = raw.trim().parse().map_err(|_| invalid())?;
    if value < min {
        return Err(invalid());
    }
    *slot = value;
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared instance
// ---------------------------------------------------------------------------

static CURRENT: Mutex<Option<HubConfig>> = Mutex::new(None);

/// Process-wide configuration, loaded from the environment on first use.
/// Callers get their own copy.
pub fn current() -> Result<HubConfig, ConfigError> {
    let mut slot = CURRENT.lock().expect("config lock poisoned");
    if let Some(config) = slot.as_ref() {
        return Ok(config.clone());
    }
    let config = HubConfig::from_env()?;
    *slot = Some(config.clone());
    Ok(config)
}

/// Re-read the environment and replace the shared copy.
pub fn reload() -> Result<HubConfig, ConfigError> {
    let config = HubConfig::from_env()?;
    *CURRENT.lock().expect("config lock poisoned") = Some(config.clone());
    Ok(config)
}

/// Replace the shared copy without touching the environment.
pub fn install(config: HubConfig) {
    *CURRENT.lock().expect("config lock poisoned") = Some(config);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = HubConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.keepalive(), Duration::from_secs(30));
        assert_eq!(config.empty_stream_max(), Duration::from_secs(300));
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.outbox_error_max_len, 500);
    }

    #[test]
    fn variables_override_defaults() {
        let config = HubConfig::from_lookup(lookup(&[
            ("BEADHUB_KEEPALIVE_SECONDS", "15"),
            ("BEADHUB_MAX_RETRY_ATTEMPTS", " 5 "),
            ("BEADHUB_EVENTS_DB_PATH", "/tmp/events.db"),
            ("BEADHUB_LOG_LEVEL", "DEBUG"),
            ("BEADHUB_LOG_JSON", "true"),
        ]))
        .unwrap();
        assert_eq!(config.keepalive_seconds, 15);
        assert_eq!(config.max_retry_attempts, 5);
        assert_eq!(config.database_path, PathBuf::from("/tmp/events.db"));
        assert_eq!(config.log_level, "debug");
        assert!(config.log_json);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = HubConfig::from_lookup(lookup(&[("BEADHUB_KEEPALIVE_SECONDS", "0")])).unwrap_err();
        assert!(err.to_string().contains("BEADHUB_KEEPALIVE_SECONDS"));

        let err = HubConfig::from_lookup(lookup(&[("BEADHUB_OUTBOX_BATCH_LIMIT", "lots")])).unwrap_err();
        assert!(err.to_string().contains("BEADHUB_OUTBOX_BATCH_LIMIT"));

        assert!(HubConfig::from_lookup(lookup(&[("BEADHUB_LOG_JSON", "maybe")])).is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: HubConfig = serde_json::from_str(r#"{"keepalive_seconds": 5}"#).unwrap();
        assert_eq!(config.keepalive_seconds, 5);
        assert_eq!(config.waiting_max_age_seconds, 90);
    }

    #[test]
    fn installed_config_is_returned_as_a_copy() {
        let mut custom = HubConfig::default();
        custom.keepalive_seconds = 7;
        install(custom.clone());

        let mut copy = current().unwrap();
        assert_eq!(copy, custom);
        copy.keepalive_seconds = 99;
        assert_eq!(current().unwrap().keepalive_seconds, 7);
    }
}
