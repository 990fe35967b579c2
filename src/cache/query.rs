//! Query-result cache layer.
//!
//! Wraps a [`KeyValueStore`] and keeps it honest against the origin: the
//! first write for a collection registers an eviction observer with the
//! change-notification registry, and a change event for that collection
//! evicts every cached query under its prefix.
//!
//! Cache faults are strictly best-effort: a store error on read is
//! served as a miss, and a store error on write is logged while the
//! drained payload is still handed back, so the request path never
//! fails because the cache did.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{FutureExt, StreamExt, stream::BoxStream};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ingest::{ChangeEvent, ObserverCallback, ObserverRegistry};

use super::keys::{effective_parts, query_key};
use super::lock::rw_write;
use super::store::{KeyValueStore, StoreError};

const SOURCE: &str = "cache::query";

const METRIC_CACHE_HIT: &str = "velo_cache_hit_total";
const METRIC_CACHE_MISS: &str = "velo_cache_miss_total";
const METRIC_CACHE_EVICT: &str = "velo_cache_evict_total";

/// A single-read byte stream, as produced by an HTTP response body.
pub type PayloadStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Control flow, not a failure: the caller falls through to the
    /// origin. Store timeouts and backend faults are folded into this
    /// variant after being logged.
    #[error("cache miss for `{key}`")]
    Miss { key: String },
    #[error("failed to read payload stream: {0}")]
    Payload(#[from] io::Error),
}

/// The cache seam used by the request router.
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Look up the cached payload for a query.
    async fn get(&self, collection: &str, raw_query: &str) -> Result<Bytes, CacheError>;

    /// Consume the (single-read) payload stream, cache it, and return
    /// the drained bytes so the caller can still serve them.
    async fn set(
        &self,
        collection: &str,
        raw_query: &str,
        payload: PayloadStream,
    ) -> Result<Bytes, CacheError>;
}

async fn drain_payload(mut payload: PayloadStream) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

// ============================================================================
// Invalidating query cache
// ============================================================================

/// Query cache whose entries are evicted by inbound change events.
#[derive(Clone)]
pub struct InvalidatingQueryCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    /// Collections with a registered eviction observer. Membership test
    /// and observer registration happen under this lock's write guard so
    /// that exactly one registration wins under concurrent first writes.
    observed: RwLock<HashSet<String>>,
    observers: Arc<ObserverRegistry>,
}

impl InvalidatingQueryCache {
    pub fn new(store: Arc<dyn KeyValueStore>, observers: Arc<ObserverRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                observed: RwLock::new(HashSet::new()),
                observers,
            }),
        }
    }
}

impl Inner {
    /// Register the eviction observer for a collection, once.
    ///
    /// A second call for an already-observed collection is a no-op. A
    /// registry refusal (some other party holds the slot) is logged and
    /// non-fatal: the store write has already succeeded.
    fn subscribe(self: &Arc<Self>, collection: &str) {
        let mut observed = rw_write(&self.observed, SOURCE, "subscribe");
        if observed.contains(collection) {
            return;
        }
        observed.insert(collection.to_string());

        let weak = Arc::downgrade(self);
        let owned = collection.to_string();
        let callback: ObserverCallback = Arc::new(move |_event: ChangeEvent| {
            let weak: Weak<Inner> = weak.clone();
            let collection = owned.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.evict_collection(&collection).await;
                }
            }
            .boxed()
        });

        if let Err(err) = self.observers.add(collection, callback) {
            warn!(collection, error = %err, "failed to register eviction observer");
        } else {
            debug!(collection, "registered eviction observer");
        }
    }

    /// Evict every cached query for a collection.
    ///
    /// The collection is also dropped from the observed set and the
    /// registry, so the next write re-subscribes with a fresh observer.
    async fn evict_collection(&self, collection: &str) {
        rw_write(&self.observed, SOURCE, "evict").remove(collection);
        self.observers.remove(collection);

        let pattern = format!("{collection}:*");
        match self.store.delete(&pattern).await {
            Ok(()) => {
                counter!(METRIC_CACHE_EVICT).increment(1);
                info!(collection, "evicted cached queries");
            }
            Err(err) => {
                warn!(collection, error = %err, "failed to evict cached queries");
            }
        }
    }
}

#[async_trait]
impl QueryCache for InvalidatingQueryCache {
    async fn get(&self, collection: &str, raw_query: &str) -> Result<Bytes, CacheError> {
        let key = query_key(collection, raw_query);
        match self.inner.store.get(&key).await {
            Ok(payload) => {
                counter!(METRIC_CACHE_HIT).increment(1);
                Ok(payload)
            }
            Err(StoreError::NotFound) => {
                counter!(METRIC_CACHE_MISS).increment(1);
                Err(CacheError::Miss { key })
            }
            Err(err) => {
                // A slow or broken backend degrades to a miss.
                warn!(key, error = %err, "store read failed; serving as a miss");
                counter!(METRIC_CACHE_MISS).increment(1);
                Err(CacheError::Miss { key })
            }
        }
    }

    async fn set(
        &self,
        collection: &str,
        raw_query: &str,
        payload: PayloadStream,
    ) -> Result<Bytes, CacheError> {
        let payload = drain_payload(payload).await?;

        let key = query_key(collection, raw_query);
        if let Err(err) = self.inner.store.set(&key, payload.clone()).await {
            warn!(key, error = %err, "store write failed; response served uncached");
            return Ok(payload);
        }

        // Subscribe under the effective collection: an id lookup like
        // `users/42` stores under the `users` prefix and must evict with it.
        let (collection, _) = effective_parts(collection, raw_query);
        self.inner.subscribe(collection);

        Ok(payload)
    }
}

// ============================================================================
// No-op query cache
// ============================================================================

/// Null object used when caching is disabled: every read misses and
/// every write drains the stream without persisting, so the request
/// path is identical whether caching is on or off.
pub struct NoopQueryCache;

#[async_trait]
impl QueryCache for NoopQueryCache {
    async fn get(&self, collection: &str, raw_query: &str) -> Result<Bytes, CacheError> {
        Err(CacheError::Miss {
            key: query_key(collection, raw_query),
        })
    }

    async fn set(
        &self,
        _collection: &str,
        _raw_query: &str,
        payload: PayloadStream,
    ) -> Result<Bytes, CacheError> {
        Ok(drain_payload(payload).await?)
    }
}
