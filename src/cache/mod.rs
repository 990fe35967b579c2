//! Velo cache system.
//!
//! A query-result cache over a pluggable key/value store:
//!
//! - **Store**: a namespaced remote (or in-process) key/value store with
//!   TTL expiry, per-operation timeouts, and prefix-pattern deletion.
//! - **Keys**: a collection-aware key derivation that collapses
//!   single-record lookups into the filter-query key space.
//! - **Query cache**: tracks which collections hold cached entries and
//!   subscribes each one to change notifications, so a change event
//!   evicts every cached query for that collection.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `velo.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! redis_url = "redis://127.0.0.1/"
//! keyspace = "velo"
//! ttl_seconds = 600
//! # ... see config.rs for all options
//! ```

mod config;
mod keys;
pub(crate) mod lock;
mod query;
mod store;

pub use config::CacheConfig;
pub use keys::{effective_parts, query_key};
pub use query::{CacheError, InvalidatingQueryCache, NoopQueryCache, PayloadStream, QueryCache};
pub use store::{KeyValueStore, MemoryStore, RedisStore, StoreError};
