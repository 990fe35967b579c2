//! Webhook intake listener.
//!
//! A minimal HTTP surface with a single POST route. Accepted
//! notifications are handed to the dispatch task through a bounded
//! queue; the handler never blocks on a full queue, it sheds load with
//! a 503 and lets the origin retry.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use metrics::counter;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::debounce::run_dispatch;
use super::event::ChangeEvent;
use super::observers::ObserverRegistry;

const METRIC_INGEST_ACCEPTED: &str = "velo_ingest_accepted_total";
const METRIC_INGEST_REJECTED: &str = "velo_ingest_rejected_total";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to bind webhook listener on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
}

#[derive(Clone)]
struct IngestState {
    tx: mpsc::Sender<ChangeEvent>,
}

/// The webhook listener plus its dispatch task.
pub struct WebhookServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    listener_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
}

impl WebhookServer {
    /// Bind the listener and start the dispatch task.
    ///
    /// `buffer` bounds the intake queue and `interval` is the
    /// coalescing window applied before observers run.
    pub async fn bind(
        addr: SocketAddr,
        path: &str,
        observers: Arc<ObserverRegistry>,
        buffer: usize,
        interval: Duration,
    ) -> Result<Self, IngestError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| IngestError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| IngestError::Bind { addr, source })?;

        let (tx, rx) = mpsc::channel(buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatch_task = tokio::spawn(run_dispatch(rx, observers, interval, shutdown_rx));

        let app = router(path, tx);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let listener_task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %err, "webhook listener failed");
            }
        });

        info!(%local_addr, path, "webhook listener started");
        Ok(Self {
            local_addr,
            shutdown_tx,
            listener_task,
            dispatch_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting notifications and flush the pending window.
    ///
    /// Resolves once the listener has drained and the dispatch task has
    /// run its final flush.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.listener_task.await {
            warn!(error = %err, "webhook listener task aborted");
        }
        if let Err(err) = self.dispatch_task.await {
            warn!(error = %err, "event dispatch task aborted");
        }
        info!("webhook listener stopped");
    }
}

fn router(path: &str, tx: mpsc::Sender<ChangeEvent>) -> Router {
    Router::new()
        .route(path, post(receive))
        .with_state(IngestState { tx })
}

async fn receive(State(state): State<IngestState>, headers: HeaderMap, body: Bytes) -> Response {
    if !has_json_content_type(&headers) {
        counter!(METRIC_INGEST_REJECTED).increment(1);
        return (StatusCode::BAD_REQUEST, "expected application/json").into_response();
    }

    let event: ChangeEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            counter!(METRIC_INGEST_REJECTED).increment(1);
            return (StatusCode::BAD_REQUEST, format!("invalid change event: {err}"))
                .into_response();
        }
    };

    match state.tx.try_send(event) {
        Ok(()) => {
            counter!(METRIC_INGEST_ACCEPTED).increment(1);
            StatusCode::OK.into_response()
        }
        Err(err) => {
            warn!(error = %err, "change event dropped at intake");
            counter!(METRIC_INGEST_REJECTED).increment(1);
            (StatusCode::SERVICE_UNAVAILABLE, "notification queue unavailable").into_response()
        }
    }
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim_start().starts_with("application/json"))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn request(content_type: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/webhook");
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    fn fixture(buffer: usize) -> (Router, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (router("/webhook", tx), rx)
    }

    #[tokio::test]
    async fn accepts_json_notification() {
        let (app, mut rx) = fixture(4);

        let response = app
            .oneshot(request(
                Some("application/json"),
                r#"{"event":"update","collection":"users","key":"42"}"#,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let event = rx.try_recv().expect("queued event");
        assert_eq!(event.collection, "users");
        assert_eq!(event.key, "42");
    }

    #[tokio::test]
    async fn json_content_type_with_charset_is_accepted() {
        let (app, mut rx) = fixture(4);

        let response = app
            .oneshot(request(
                Some("application/json; charset=utf-8"),
                r#"{"collection":"users"}"#,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn rejects_missing_content_type() {
        let (app, mut rx) = fixture(4);

        let response = app
            .oneshot(request(None, r#"{"collection":"users"}"#))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejects_malformed_body() {
        let (app, mut rx) = fixture(4);

        let response = app
            .oneshot(request(Some("application/json"), "{not json"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejects_non_post_methods() {
        let (app, _rx) = fixture(4);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/webhook")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn sheds_load_when_queue_is_full() {
        let (app, _rx) = fixture(1);

        let first = app
            .clone()
            .oneshot(request(Some("application/json"), r#"{"collection":"a"}"#))
            .await
            .expect("response");
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(request(Some("application/json"), r#"{"collection":"b"}"#))
            .await
            .expect("response");
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn bind_and_shutdown_flushes() {
        let observers = Arc::new(ObserverRegistry::new());
        let server = WebhookServer::bind(
            "127.0.0.1:0".parse().expect("addr"),
            "/webhook",
            observers,
            16,
            Duration::from_secs(3600),
        )
        .await
        .expect("bind");

        assert_ne!(server.local_addr().port(), 0);
        server.shutdown().await;
    }
}
