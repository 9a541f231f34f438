//! Local caching proxy: every request is answered by the worker on behalf of
//! the configured origin.

use axum::{
  body::{Body, Bytes},
  extract::State,
  http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
  response::{IntoResponse, Response as HttpResponse},
  Router,
};
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use url::Url;

use crate::cache::{CacheStorage, FetchResult};
use crate::http::{Network, Request};
use crate::sync::SubmissionStore;
use crate::worker::Worker;

/// Headers that describe one hop and must not be forwarded.
const HOP_HEADERS: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-connection",
  "transfer-encoding",
  "upgrade",
  "te",
  "trailer",
  "host",
  "content-length",
  // Bodies are stored and returned decoded
  "content-encoding",
];

/// Stripped from forwarded requests. The network client negotiates and
/// decodes its own encodings; a client's `br` or `zstd` would come back
/// still encoded.
const REQUEST_SKIP_HEADERS: &[&str] = &["accept-encoding"];

struct ProxyState<S, N>
where
  S: CacheStorage + SubmissionStore + 'static,
  N: Network,
{
  worker: Arc<Worker<S, N>>,
  origin: Url,
}

impl<S, N> Clone for ProxyState<S, N>
where
  S: CacheStorage + SubmissionStore + 'static,
  N: Network,
{
  fn clone(&self) -> Self {
    Self {
      worker: Arc::clone(&self.worker),
      origin: self.origin.clone(),
    }
  }
}

pub fn router<S, N>(worker: Arc<Worker<S, N>>, origin: Url) -> Router
where
  S: CacheStorage + SubmissionStore + 'static,
  N: Network,
{
  Router::new()
    .fallback(proxy::<S, N>)
    .with_state(ProxyState { worker, origin })
    .layer(TraceLayer::new_for_http())
}

/// Serve until Ctrl+C or SIGTERM.
pub async fn run<S, N>(worker: Arc<Worker<S, N>>, origin: Url, addr: SocketAddr) -> Result<()>
where
  S: CacheStorage + SubmissionStore + 'static,
  N: Network,
{
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;

  tracing::info!(%addr, origin = %origin, "Proxy listening");

  axum::serve(listener, router(worker, origin))
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Proxy server failed: {}", e))?;

  tracing::info!("Proxy shut down");
  Ok(())
}

async fn proxy<S, N>(
  State(state): State<ProxyState<S, N>>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> HttpResponse
where
  S: CacheStorage + SubmissionStore + 'static,
  N: Network,
{
  // Only the path and query come from the client; the origin is fixed
  let mut url = state.origin.clone();
  url.set_path(uri.path());
  url.set_query(uri.query());

  let mut request = Request::new(method.as_str(), url);
  for (name, value) in &headers {
    if HOP_HEADERS.contains(&name.as_str()) || REQUEST_SKIP_HEADERS.contains(&name.as_str()) {
      continue;
    }
    if let Ok(value) = value.to_str() {
      request = request.with_header(name.as_str(), value);
    }
  }
  if !body.is_empty() {
    request = request.with_body(body.to_vec());
  }

  match state.worker.respond(request).await {
    Ok(result) => into_http(result),
    Err(e) => {
      tracing::error!(error = %e, "Proxy request failed");
      (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
    }
  }
}

fn into_http(result: FetchResult) -> HttpResponse {
  let mut builder = axum::http::Response::builder().status(result.response.status);
  for (name, value) in &result.response.headers {
    if !HOP_HEADERS.contains(&name.as_str()) {
      builder = builder.header(name.as_str(), value.as_str());
    }
  }
  builder = builder.header("x-offcache-source", HeaderValue::from_static(result.source.as_str()));

  builder
    .body(Body::from(result.response.body))
    .unwrap_or_else(|e| {
      tracing::error!(error = %e, "Invalid upstream response");
      StatusCode::BAD_GATEWAY.into_response()
    })
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!(error = %e, "Failed to listen for Ctrl+C");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        tracing::error!(error = %e, "Failed to install SIGTERM handler");
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }

  tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::Config;
  use crate::http::Response;
  use crate::testing::{url, MockNetwork};
  use axum::body::to_bytes;
  use tower::ServiceExt;

  async fn proxy_for(network: &MockNetwork) -> Router {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let mut config = Config::with_origin(url("/"));
    config.cache.precache = Vec::new();
    let worker = Worker::new(&config, storage, Arc::new(network.clone())).unwrap();
    worker.start().await.unwrap();
    router(Arc::new(worker), url("/"))
  }

  fn get(path: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
      .uri(path)
      .body(Body::empty())
      .unwrap()
  }

  #[tokio::test]
  async fn test_proxy_marks_source() {
    let network = MockNetwork::new();
    network.respond("/js/app.js", Response::text(200, "let a = 1;"));
    let app = proxy_for(&network).await;

    let first = app.clone().oneshot(get("/js/app.js")).await.unwrap();
    assert_eq!(first.headers()["x-offcache-source"], "network");

    let second = app.oneshot(get("/js/app.js")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["x-offcache-source"], "cache");
    let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"let a = 1;");
  }

  #[tokio::test]
  async fn test_proxy_offline_api() {
    let network = MockNetwork::new();
    let app = proxy_for(&network).await;
    network.set_offline(true);

    let response = app.oneshot(get("/api/teams")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.headers()["x-offcache-source"], "fallback");
  }

  #[tokio::test]
  async fn test_proxy_queues_offline_post() {
    let network = MockNetwork::new();
    let app = proxy_for(&network).await;
    network.set_offline(true);

    let request = axum::http::Request::builder()
      .method("POST")
      .uri("/api/teams")
      .header("content-type", "application/json")
      .body(Body::from(r#"{"name":"x"}"#))
      .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
  }

  #[tokio::test]
  async fn test_proxy_keeps_requests_on_origin() {
    let network = MockNetwork::new();
    let app = proxy_for(&network).await;
    let before = network.calls().len();

    app
      .oneshot(get("//evil.example/api/steal?token=1"))
      .await
      .unwrap();

    let calls = network.calls();
    assert!(calls.len() > before);
    for call in &calls[before..] {
      assert_eq!(call.url.host_str(), Some("hack.example"));
      assert_eq!(call.url.path(), "//evil.example/api/steal");
      assert_eq!(call.url.query(), Some("token=1"));
    }
  }

  #[tokio::test]
  async fn test_proxy_does_not_forward_accept_encoding() {
    let network = MockNetwork::new();
    network.respond("/api/teams", Response::json(200, &serde_json::json!([])));
    let app = proxy_for(&network).await;

    let request = axum::http::Request::builder()
      .uri("/api/teams")
      .header("accept-encoding", "br, zstd")
      .header("accept-language", "en")
      .body(Body::empty())
      .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let forwarded = network.calls().pop().unwrap();
    assert_eq!(forwarded.url, url("/api/teams"));
    assert_eq!(forwarded.header("accept-encoding"), None);
    assert_eq!(forwarded.header("accept-language"), Some("en"));
  }
}
