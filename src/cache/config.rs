//! Cache configuration.
//!
//! Controls the query cache and the invalidation pipeline via `velo.toml`.

use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_KEYSPACE: &str = "velo";
const DEFAULT_TTL_SECONDS: u64 = 600;
const DEFAULT_OP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DEBOUNCE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Cache configuration from `velo.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the query-result cache.
    pub enabled: bool,
    /// Keyspace prefix applied to every store key, so multiple logical
    /// caches can share one physical store.
    pub keyspace: String,
    /// Entry time-to-live enforced by the store.
    pub ttl_seconds: u64,
    /// Upper bound for a single store operation.
    pub op_timeout_ms: u64,
    /// Debounce window over inbound change notifications.
    pub debounce_interval_ms: u64,
    /// Capacity of the notification handoff queue; bounds memory during
    /// a notification burst.
    pub event_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keyspace: DEFAULT_KEYSPACE.to_string(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            op_timeout_ms: DEFAULT_OP_TIMEOUT_MS,
            debounce_interval_ms: DEFAULT_DEBOUNCE_INTERVAL_MS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            keyspace: settings.keyspace.clone(),
            ttl_seconds: settings.ttl_seconds,
            op_timeout_ms: settings.op_timeout_ms,
            debounce_interval_ms: settings.debounce_interval_ms,
            event_buffer: settings.event_buffer,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds.max(1))
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms.max(1))
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_interval_ms.max(1))
    }

    /// Returns the handoff queue capacity, clamping to 1 if zero.
    pub fn event_buffer_non_zero(&self) -> usize {
        self.event_buffer.max(1)
    }
}
