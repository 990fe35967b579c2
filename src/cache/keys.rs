//! Cache key derivation.
//!
//! Maps a (collection, raw query string) pair to a stable store key of
//! the form `<collection>:<xxh64 hex>`. All entries for one collection
//! share the collection prefix, which is what makes collection-level
//! eviction a single prefix delete.

use std::borrow::Cow;

use xxhash_rust::xxh64::xxh64;

/// Resolve the effective (collection, query) pair for key derivation.
///
/// A collection path of the form `"<collection>/<id>"` is a
/// single-record lookup; it is rewritten so that the effective
/// collection is the prefix and the effective query is the canonical
/// equality filter over `id`. This guarantees that "get by id" and "get
/// by the equivalent filter" collapse to the same cache key. The filter
/// shape is byte-exact by contract: external consumers derive the same
/// keys, so it must not be reformatted.
pub fn effective_parts<'a>(collection: &'a str, raw_query: &'a str) -> (&'a str, Cow<'a, str>) {
    let mut segments = collection.split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(prefix), Some(id), None) => {
            (prefix, Cow::Owned(format!("{{\"id\":{{\"_eq\":\"{id}\"}}}}")))
        }
        _ => (collection, Cow::Borrowed(raw_query)),
    }
}

/// Derive the store key for a query against a collection.
///
/// Deterministic: identical inputs always yield the identical key. The
/// query hash is xxHash64 (seed 0), rendered as lowercase hex. The hash
/// is collision-tolerant, not security-sensitive: a collision serves a
/// wrong-but-valid cached payload for the lifetime of one TTL.
pub fn query_key(collection: &str, raw_query: &str) -> String {
    let (collection, query) = effective_parts(collection, raw_query);
    format!("{collection}:{:x}", xxh64(query.as_bytes(), 0))
}
