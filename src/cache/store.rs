//! Key/value store implementations.
//!
//! `RedisStore` is the production backend: a remote, namespaced store
//! with TTL expiry enforced server-side. `MemoryStore` is an in-process
//! equivalent with lazy expiry, used by the test suites. Both bound
//! every operation with the configured timeout and surface a timeout as
//! an error, never a hang or a panic.

use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;
// tokio's Instant so that paused-time tests can drive expiry.
use tokio::time::Instant;

use super::config::CacheConfig;
use super::lock::rw_write;

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is not present (or has expired). Not a failure: callers
    /// treat this as a cache miss.
    #[error("key not found")]
    NotFound,
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// A namespaced key/value store with TTL expiry.
///
/// Every logical key is stored under `<keyspace>:<key>`. `delete`
/// accepts a trailing-wildcard pattern (`"users:*"`) so an entire
/// collection can be evicted in one call; the backend enumerates the
/// matching keys and batch-deletes them, and partial failure of the
/// batch surfaces as an error.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;
    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError>;
    async fn delete(&self, pattern: &str) -> Result<(), StoreError>;
    /// Delete every key under the store's namespace.
    async fn clear(&self) -> Result<(), StoreError>;
}

// ============================================================================
// Redis store
// ============================================================================

pub struct RedisStore {
    conn: ConnectionManager,
    keyspace: String,
    op_timeout: Duration,
    ttl: Duration,
}

impl RedisStore {
    /// Connect to redis and return a store scoped to the configured
    /// keyspace.
    pub async fn connect(url: &str, config: &CacheConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            keyspace: config.keyspace.clone(),
            op_timeout: config.op_timeout(),
            ttl: config.ttl(),
        })
    }

    fn physical(&self, key: &str) -> String {
        format!("{}:{}", self.keyspace, key)
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, redis::RedisError>> + Send,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let mut conn = self.conn.clone();
        let physical = self.physical(key);
        let value: Option<Vec<u8>> = self.bounded(async move { conn.get(physical).await }).await?;
        value.map(Bytes::from).ok_or(StoreError::NotFound)
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let physical = self.physical(key);
        let ttl_secs = self.ttl.as_secs().max(1);
        self.bounded(async move { conn.set_ex(physical, value.as_ref(), ttl_secs).await })
            .await
    }

    async fn delete(&self, pattern: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let physical = self.physical(pattern);
        self.bounded(async move {
            let keys: Vec<String> = conn.keys(physical).await?;
            if keys.is_empty() {
                return Ok(());
            }
            conn.del(keys).await
        })
        .await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.delete("*").await
    }
}

// ============================================================================
// In-memory store
// ============================================================================

struct MemoryEntry {
    payload: Bytes,
    expires_at: Instant,
}

/// In-process store with the same contract as `RedisStore`.
///
/// Expiry is lazy: an entry past its deadline is dropped on the next
/// lookup that touches it.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    keyspace: String,
    ttl: Duration,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            keyspace: config.keyspace.clone(),
            ttl: config.ttl(),
        }
    }

    fn physical(&self, key: &str) -> String {
        format!("{}:{}", self.keyspace, key)
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "len");
        entries.retain(|_, entry| entry.expires_at > now);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let physical = self.physical(key);
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        match entries.get(&physical) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(entry.payload.clone()),
            Some(_) => {
                entries.remove(&physical);
                Err(StoreError::NotFound)
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let physical = self.physical(key);
        let entry = MemoryEntry {
            payload: value,
            expires_at: Instant::now() + self.ttl,
        };
        rw_write(&self.entries, SOURCE, "set").insert(physical, entry);
        Ok(())
    }

    async fn delete(&self, pattern: &str) -> Result<(), StoreError> {
        let physical = self.physical(pattern);
        let mut entries = rw_write(&self.entries, SOURCE, "delete");
        match physical.strip_suffix('*') {
            Some(prefix) => entries.retain(|key, _| !key.starts_with(prefix)),
            None => {
                entries.remove(&physical);
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let prefix = format!("{}:", self.keyspace);
        rw_write(&self.entries, SOURCE, "clear").retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}
