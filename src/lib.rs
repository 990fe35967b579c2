//! Velo, a caching front for item-query APIs.
//!
//! Velo sits between callers and an item-query origin serving
//! `/items/<collection>` endpoints. Read queries are answered from a
//! TTL key/value cache when possible; the origin pushes change
//! notifications to a webhook listener, and Velo coalesces those into
//! collection-level cache evictions.
//!
//! Layers, leaves first:
//!
//! - [`cache`]: key/value store abstraction, cache key derivation, and
//!   the invalidating query-result cache.
//! - [`ingest`]: the webhook listener plus the debounce/dispatch
//!   pipeline that fans deduplicated change events out to observers.
//! - [`client`]: the cached request router with structured queries,
//!   the raw proxy entry point, and the outbound transport seam.
//! - [`config`] / [`infra`]: settings resolution and telemetry.

pub mod cache;
pub mod client;
pub mod config;
pub mod infra;
pub mod ingest;
