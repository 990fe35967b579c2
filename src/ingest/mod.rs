//! Change-event ingestion.
//!
//! The origin posts a JSON change notification whenever a record
//! mutates. Ingestion has three stages:
//!
//! - **Listener**: a dedicated HTTP endpoint that validates and queues
//!   notifications without doing any work inline.
//! - **Debounce**: a coalescing window that collapses bursts for the
//!   same record into one dispatch.
//! - **Observers**: per-collection callbacks (plus a wildcard slot)
//!   that react to dispatched events, typically by evicting cache
//!   entries.

mod debounce;
mod event;
mod observers;
mod server;

pub use event::ChangeEvent;
pub use observers::{DuplicateObserverError, ObserverCallback, ObserverRegistry, WILDCARD};
pub use server::{IngestError, WebhookServer};
