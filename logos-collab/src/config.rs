//! Tunables for the sync core.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How shape locks constrain ordinary edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Updates and deletes of a shape locked by someone else fail.
    #[default]
    Enforced,
    /// Locks are informational; only lock/unlock check the holder.
    Advisory,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Sync core configuration. Intervals are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum gap between cursor writes (50ms = 20Hz)
    pub cursor_throttle_ms: u64,
    /// Minimum gap between drag writes (16ms ≈ 60Hz)
    pub drag_throttle_ms: u64,
    /// Presence entries not refreshed for this long are hidden from readers
    pub presence_stale_after_ms: u64,
    /// Connections silent for this long are reaped
    pub liveness_timeout_ms: u64,
    pub reaper_interval_ms: u64,
    pub lock_policy: LockPolicy,
    /// Locks older than this may be taken over. `None` = never.
    pub lock_ttl_ms: Option<u64>,
    /// Buffered change events per ephemeral subscriber
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cursor_throttle_ms: 50,
            drag_throttle_ms: 16,
            presence_stale_after_ms: 60_000,
            liveness_timeout_ms: 30_000,
            reaper_interval_ms: 5_000,
            lock_policy: LockPolicy::Enforced,
            lock_ttl_ms: Some(5 * 60 * 1000),
            channel_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Short liveness windows so reaper tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            presence_stale_after_ms: 2_000,
            liveness_timeout_ms: 200,
            reaper_interval_ms: 50,
            lock_ttl_ms: Some(60_000),
            ..Self::default()
        }
    }

    /// Defaults overridden by `LOGOS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = parse_var("LOGOS_CURSOR_THROTTLE_MS")? {
            config.cursor_throttle_ms = v;
        }
        if let Some(v) = parse_var("LOGOS_DRAG_THROTTLE_MS")? {
            config.drag_throttle_ms = v;
        }
        if let Some(v) = parse_var("LOGOS_PRESENCE_STALE_MS")? {
            config.presence_stale_after_ms = v;
        }
        if let Some(v) = parse_var("LOGOS_LIVENESS_TIMEOUT_MS")? {
            config.liveness_timeout_ms = v;
        }
        if let Some(v) = parse_var("LOGOS_REAPER_INTERVAL_MS")? {
            config.reaper_interval_ms = v;
        }
        if let Some(v) = parse_var("LOGOS_CHANNEL_CAPACITY")? {
            config.channel_capacity = v;
        }
        if let Ok(raw) = env::var("LOGOS_LOCK_POLICY") {
            config.lock_policy = match raw.to_ascii_lowercase().as_str() {
                "enforced" => LockPolicy::Enforced,
                "advisory" => LockPolicy::Advisory,
                _ => return Err(ConfigError::Invalid { key: "LOGOS_LOCK_POLICY", value: raw }),
            };
        }
        if let Ok(raw) = env::var("LOGOS_LOCK_TTL_MS") {
            config.lock_ttl_ms = match raw.as_str() {
                "" | "none" | "off" => None,
                _ => Some(raw.parse().map_err(|_| ConfigError::Invalid {
                    key: "LOGOS_LOCK_TTL_MS",
                    value: raw.clone(),
                })?),
            };
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall the liveness machinery.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reaper_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "reaper_interval_ms",
                value: "0".into(),
            });
        }
        if self.liveness_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "liveness_timeout_ms",
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn cursor_throttle(&self) -> Duration {
        Duration::from_millis(self.cursor_throttle_ms)
    }

    pub fn drag_throttle(&self) -> Duration {
        Duration::from_millis(self.drag_throttle_ms)
    }

    pub fn presence_stale_after(&self) -> Duration {
        Duration::from_millis(self.presence_stale_after_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn lock_ttl(&self) -> Option<Duration> {
        self.lock_ttl_ms.map(Duration::from_millis)
    }
}

fn parse_var<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(None),
    }
}
