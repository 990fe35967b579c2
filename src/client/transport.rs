//! Origin transport seam.
//!
//! The request router talks to the origin through the [`Transport`]
//! trait so tests can script origin behavior without a network.
//! [`HttpTransport`] is the production implementation over `reqwest`.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::cache::PayloadStream;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid origin url: {0}")]
    Url(#[from] url::ParseError),
    #[error("origin request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A request on its way to the origin, already stripped of any proxy
/// prefix. `path` is relative to the origin base URL.
pub struct OriginRequest {
    pub method: Method,
    pub path: String,
    pub raw_query: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// The origin's answer, body still streaming.
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: PayloadStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OriginRequest) -> Result<OriginResponse, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    /// Build a transport for an origin. `base_url` must end with a
    /// trailing slash so relative paths join under it.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OriginRequest) -> Result<OriginResponse, TransportError> {
        let mut url = self.base_url.join(request.path.trim_start_matches('/'))?;
        if !request.raw_query.is_empty() {
            url.set_query(Some(&request.raw_query));
        }
        debug!(method = %request.method, %url, "forwarding request to origin");

        let mut builder = self
            .client
            .request(request.method, url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body: PayloadStream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(io::Error::other))
            .boxed();

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}
