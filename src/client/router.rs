//! Cached request routing.
//!
//! [`ItemClient`] fronts the origin's item API with the query cache:
//! GET requests for item collections are answered from the cache when
//! possible and cached on the way back when the origin answers 200.
//! Everything else passes through untouched. The proxy router exposes
//! the same path over plain HTTP for callers that are not in-process.

use std::fmt;
use std::io;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::BytesMut;
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheError, PayloadStream, QueryCache};

use super::query::{ItemQuery, QueryError};
use super::response::ItemResult;
use super::transport::{OriginRequest, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("origin access token is not configured")]
    MissingToken,
    #[error("method {0} is not supported")]
    UnsupportedMethod(Method),
    #[error("origin returned status {status}")]
    Status { status: StatusCode },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("failed to read origin response: {0}")]
    Body(#[from] io::Error),
    #[error("failed to encode or decode origin payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cache failure: {0}")]
    Cache(#[from] CacheError),
}

/// A fully buffered response, served from cache or from the origin.
#[derive(Debug)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub from_cache: bool,
}

/// Origin client with a read-through query cache.
#[derive(Clone)]
pub struct ItemClient {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn QueryCache>,
    token: String,
}

impl fmt::Debug for ItemClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemClient").finish_non_exhaustive()
    }
}

impl ItemClient {
    /// Requires a non-empty access token; every forwarded request
    /// carries it as a bearer credential.
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<dyn QueryCache>,
        token: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ClientError::MissingToken);
        }
        Ok(Self {
            transport,
            cache,
            token,
        })
    }

    /// Route one request through the cache to the origin.
    ///
    /// Only GET requests against `items/<collection>` paths touch the
    /// cache, and only a 200 answer is stored. Cached hits synthesize a
    /// 200 with a JSON content type; the origin's exact body bytes are
    /// what was stored, so a hit is byte-identical to the miss that
    /// filled it.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        raw_query: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<CachedResponse, ClientError> {
        if !matches!(method, Method::GET | Method::POST | Method::PATCH | Method::DELETE) {
            return Err(ClientError::UnsupportedMethod(method));
        }

        let collection = item_collection(path);
        let cacheable = method == Method::GET && collection.is_some();

        if cacheable
            && let Some(collection) = collection
            && let Ok(payload) = self.cache.get(collection, raw_query).await
        {
            debug!(collection, "served from cache");
            return Ok(CachedResponse {
                status: StatusCode::OK,
                headers: json_headers(),
                body: payload,
                from_cache: true,
            });
        }

        let response = self
            .transport
            .send(OriginRequest {
                method,
                path: path.to_string(),
                raw_query: raw_query.to_string(),
                headers: self.outbound_headers(headers),
                body,
            })
            .await?;

        let body = if cacheable && response.status == StatusCode::OK {
            // Fresh copy of exactly what was stored. A body stream that
            // breaks mid-read is an origin fault, not a cache fault.
            let collection = collection.unwrap_or_default();
            self.cache
                .set(collection, raw_query, response.body)
                .await
                .map_err(|err| match err {
                    CacheError::Payload(source) => ClientError::Body(source),
                    other => ClientError::Cache(other),
                })?
        } else {
            read_body(response.body).await?
        };

        Ok(CachedResponse {
            status: response.status,
            headers: response.headers,
            body,
            from_cache: false,
        })
    }

    /// Query a collection and decode the item envelope.
    pub async fn items<T: DeserializeOwned>(
        &self,
        collection: &str,
        query: &ItemQuery,
    ) -> Result<ItemResult<T>, ClientError> {
        let raw_query = query.build()?;
        let response = self
            .call(
                Method::GET,
                &format!("items/{collection}"),
                &raw_query,
                HeaderMap::new(),
                None,
            )
            .await?;
        decode(&response)
    }

    /// Fetch a single record by primary key.
    pub async fn item<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<ItemResult<T>, ClientError> {
        let response = self
            .call(
                Method::GET,
                &format!("items/{collection}/{id}"),
                "",
                HeaderMap::new(),
                None,
            )
            .await?;
        decode(&response)
    }

    /// Create a record. The origin answers with the stored record.
    pub async fn create<T: DeserializeOwned, B: Serialize>(
        &self,
        collection: &str,
        record: &B,
    ) -> Result<ItemResult<T>, ClientError> {
        let body = Bytes::from(serde_json::to_vec(record)?);
        let response = self
            .call(
                Method::POST,
                &format!("items/{collection}"),
                "",
                json_headers(),
                Some(body),
            )
            .await?;
        decode(&response)
    }

    /// Apply a partial update to a record.
    pub async fn update<T: DeserializeOwned, B: Serialize>(
        &self,
        collection: &str,
        id: &str,
        patch: &B,
    ) -> Result<ItemResult<T>, ClientError> {
        let body = Bytes::from(serde_json::to_vec(patch)?);
        let response = self
            .call(
                Method::PATCH,
                &format!("items/{collection}/{id}"),
                "",
                json_headers(),
                Some(body),
            )
            .await?;
        decode(&response)
    }

    /// Delete a record by primary key.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), ClientError> {
        let response = self
            .call(
                Method::DELETE,
                &format!("items/{collection}/{id}"),
                "",
                HeaderMap::new(),
                None,
            )
            .await?;
        if !response.status.is_success() {
            return Err(ClientError::Status {
                status: response.status,
            });
        }
        Ok(())
    }

    fn outbound_headers(&self, mut headers: HeaderMap) -> HeaderMap {
        headers.remove(header::HOST);
        match HeaderValue::from_str(&format!("Bearer {}", self.token)) {
            Ok(value) => {
                headers.insert(header::AUTHORIZATION, value);
            }
            Err(_) => {
                warn!("access token is not a valid header value; forwarding without credentials");
            }
        }
        headers
    }
}

/// The collection part of an item path, e.g. `items/users/42` yields
/// `users/42`. Non-item paths are never cached.
fn item_collection(path: &str) -> Option<&str> {
    let trimmed = path.trim_start_matches('/');
    let collection = trimmed.strip_prefix("items/")?.trim_end_matches('/');
    if collection.is_empty() {
        return None;
    }
    Some(collection)
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers
}

fn decode<T: DeserializeOwned>(response: &CachedResponse) -> Result<ItemResult<T>, ClientError> {
    if !response.status.is_success() {
        return Err(ClientError::Status {
            status: response.status,
        });
    }
    Ok(serde_json::from_slice(&response.body)?)
}

async fn read_body(mut body: PayloadStream) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

// ============================================================================
// Proxy router
// ============================================================================

#[derive(Clone)]
struct ProxyState {
    client: ItemClient,
    strip_segments: usize,
}

/// HTTP front for [`ItemClient::call`].
///
/// Every inbound path is forwarded after dropping the first
/// `strip_segments` path segments, so a gateway mounted at `/api` can
/// forward `/api/items/users` as `items/users`.
pub fn proxy_router(client: ItemClient, strip_segments: usize) -> Router {
    Router::new()
        .fallback(proxy)
        .with_state(ProxyState {
            client,
            strip_segments,
        })
}

async fn proxy(
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = strip_segments(uri.path(), state.strip_segments);
    let raw_query = uri.query().unwrap_or("");
    let body = if body.is_empty() { None } else { Some(body) };

    match state.client.call(method, &path, raw_query, headers, body).await {
        Ok(response) => {
            let mut headers = response.headers;
            // axum recomputes framing for the buffered body.
            headers.remove(header::CONTENT_LENGTH);
            headers.remove(header::TRANSFER_ENCODING);
            (response.status, headers, response.body).into_response()
        }
        Err(err @ ClientError::UnsupportedMethod(_)) => {
            (StatusCode::METHOD_NOT_ALLOWED, err.to_string()).into_response()
        }
        Err(err @ (ClientError::Transport(_) | ClientError::Body(_))) => {
            warn!(error = %err, "origin request failed");
            (StatusCode::BAD_GATEWAY, err.to_string()).into_response()
        }
        Err(err) => {
            warn!(error = %err, "proxy request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn strip_segments(path: &str, count: usize) -> String {
    path.trim_start_matches('/')
        .split('/')
        .skip(count)
        .collect::<Vec<_>>()
        .join("/")
}
