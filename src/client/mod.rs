//! Origin client.
//!
//! Talks to the remote item API on behalf of callers, with the query
//! cache in front of GET traffic. The [`Transport`] trait isolates the
//! wire so tests can script the origin; [`ItemClient`] is the typed
//! surface and [`proxy_router`] the plain-HTTP one.

mod query;
mod response;
mod router;
mod transport;

pub use query::{ItemQuery, MAX_LIMIT, MetaField, QueryError};
pub use response::{ItemError, ItemResult};
pub use router::{CachedResponse, ClientError, ItemClient, proxy_router};
pub use transport::{HttpTransport, OriginRequest, OriginResponse, Transport, TransportError};
