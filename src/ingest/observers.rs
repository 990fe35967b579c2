//! Observer registry.
//!
//! Maps a collection name to the callback that runs when a change event
//! for that collection is dispatched. One observer per collection; the
//! wildcard slot `"*"` receives every event in addition to the exact
//! match.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use thiserror::Error;

use crate::cache::lock::{rw_read, rw_write};

use super::event::ChangeEvent;

const SOURCE: &str = "ingest::observers";

/// Collection name that subscribes an observer to every event.
pub const WILDCARD: &str = "*";

/// Async callback invoked with each dispatched event.
pub type ObserverCallback = Arc<dyn Fn(ChangeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
#[error("an observer is already registered for `{collection}`")]
pub struct DuplicateObserverError {
    pub collection: String,
}

#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<HashMap<String, ObserverCallback>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for a collection (or [`WILDCARD`]).
    ///
    /// Each slot holds at most one observer; a second registration for
    /// the same collection is refused rather than silently replaced.
    pub fn add(
        &self,
        collection: &str,
        callback: ObserverCallback,
    ) -> Result<(), DuplicateObserverError> {
        let mut observers = rw_write(&self.observers, SOURCE, "add");
        if observers.contains_key(collection) {
            return Err(DuplicateObserverError {
                collection: collection.to_string(),
            });
        }
        observers.insert(collection.to_string(), callback);
        Ok(())
    }

    /// Drop the observer for a collection, if any.
    pub fn remove(&self, collection: &str) {
        rw_write(&self.observers, SOURCE, "remove").remove(collection);
    }

    pub fn contains(&self, collection: &str) -> bool {
        rw_read(&self.observers, SOURCE, "contains").contains_key(collection)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.observers, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the callbacks interested in a collection: the exact
    /// match first, then the wildcard. Cloned out of the lock so an
    /// observer can unregister itself (or others) while running.
    pub fn callbacks_for(&self, collection: &str) -> Vec<ObserverCallback> {
        let observers = rw_read(&self.observers, SOURCE, "callbacks_for");
        let mut callbacks = Vec::with_capacity(2);
        if let Some(exact) = observers.get(collection) {
            callbacks.push(exact.clone());
        }
        if collection != WILDCARD
            && let Some(wildcard) = observers.get(WILDCARD)
        {
            callbacks.push(wildcard.clone());
        }
        callbacks
    }
}
