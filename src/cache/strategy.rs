//! Caching strategies that decide between partition, network and fallback.

use std::sync::Arc;
use url::Url;

use super::key::RequestKey;
use super::partition::{PartitionNames, Purpose};
use super::storage::CacheStorage;
use super::traits::{CachedResponse, FetchResult};
use crate::classify::Category;
use crate::http::{Network, Request, Response};

/// Runs the caching strategy for a classified request.
///
/// The executor reads and writes entries in existing partitions but never
/// creates or deletes partitions. Network failure is the only failure it
/// handles, and every strategy turns it into a response.
pub struct StrategyExecutor<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  partitions: PartitionNames,
  vary_headers: Vec<String>,
  /// Document served for navigations while offline
  app_root: Url,
}

impl<S: CacheStorage + 'static, N: Network> StrategyExecutor<S, N> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    partitions: PartitionNames,
    vary_headers: Vec<String>,
    app_root: Url,
  ) -> Self {
    Self {
      storage,
      network,
      partitions,
      vary_headers,
      app_root,
    }
  }

  /// Dispatch to the strategy for `category`.
  pub async fn execute(&self, category: Category, request: Request) -> FetchResult {
    match category {
      Category::Static => self.cache_first(request).await,
      Category::Image => self.stale_while_revalidate(request).await,
      Category::Api => self.network_first(request).await,
      Category::Navigation => self.navigation(request).await,
      Category::Skip => self.passthrough(request).await,
    }
  }

  /// Serve from the static partition; only hit the network on a miss.
  pub async fn cache_first(&self, request: Request) -> FetchResult {
    let partition = self.partitions.name(Purpose::Static);
    let key = self.key(&request);

    if let Some(cached) = self.lookup(partition, &key) {
      tracing::debug!(url = %request.url, partition, "Cache hit");
      return FetchResult::from_cache(cached);
    }

    match self.network.fetch(request.clone()).await {
      Ok(response) => {
        self.store(partition, &key, &response);
        FetchResult::from_network(response)
      }
      Err(e) => {
        tracing::warn!(url = %request.url, error = %e, "Static asset unavailable");
        FetchResult::fallback(network_error_response())
      }
    }
  }

  /// Serve a cached image immediately and refresh it in the background.
  pub async fn stale_while_revalidate(&self, request: Request) -> FetchResult {
    let partition = self.partitions.name(Purpose::Image);
    let key = self.key(&request);

    if let Some(cached) = self.lookup(partition, &key) {
      self.revalidate_in_background(partition.to_string(), key, request);
      return FetchResult::from_cache(cached);
    }

    match self.network.fetch(request.clone()).await {
      Ok(response) => {
        self.store(partition, &key, &response);
        FetchResult::from_network(response)
      }
      Err(e) => {
        tracing::warn!(url = %request.url, error = %e, "Image unavailable");
        FetchResult::fallback(network_error_response())
      }
    }
  }

  /// Try the network; fall back to the dynamic partition, then to the
  /// offline JSON payload.
  pub async fn network_first(&self, request: Request) -> FetchResult {
    let partition = self.partitions.name(Purpose::Dynamic);
    let key = self.key(&request);

    match self.network.fetch(request.clone()).await {
      Ok(response) => {
        self.store(partition, &key, &response);
        FetchResult::from_network(response)
      }
      Err(e) => {
        tracing::info!(url = %request.url, error = %e, "Network failed, trying cache");
        match self.lookup(partition, &key) {
          Some(cached) => FetchResult::from_cache(cached),
          None => FetchResult::fallback(offline_api_response()),
        }
      }
    }
  }

  /// Try the network; fall back to the cached root document, then to the
  /// offline page.
  pub async fn navigation(&self, request: Request) -> FetchResult {
    match self.network.fetch(request.clone()).await {
      Ok(response) => FetchResult::from_network(response),
      Err(e) => {
        tracing::info!(url = %request.url, error = %e, "Navigation offline");
        let root = RequestKey::for_request(&Request::get(self.app_root.clone()), &self.vary_headers);
        match self.lookup(self.partitions.name(Purpose::Static), &root) {
          Some(cached) => FetchResult::from_cache(cached),
          None => FetchResult::fallback(offline_page()),
        }
      }
    }
  }

  /// Uncached network round trip for requests the classifier skipped.
  pub async fn passthrough(&self, request: Request) -> FetchResult {
    match self.network.fetch(request.clone()).await {
      Ok(response) => FetchResult::from_network(response),
      Err(e) => {
        tracing::warn!(url = %request.url, error = %e, "Passthrough request failed");
        FetchResult::fallback(Response::text(502, "Bad gateway"))
      }
    }
  }

  fn key(&self, request: &Request) -> RequestKey {
    RequestKey::for_request(request, &self.vary_headers)
  }

  /// Storage errors on lookup count as a miss.
  fn lookup(&self, partition: &str, key: &RequestKey) -> Option<CachedResponse> {
    match self.storage.match_entry(partition, key) {
      Ok(entry) => entry,
      Err(e) => {
        tracing::warn!(partition, url = key.url(), error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Write back a cacheable response. Failures are logged and dropped.
  fn store(&self, partition: &str, key: &RequestKey, response: &Response) {
    if !response.is_cacheable() {
      tracing::debug!(
        partition,
        url = key.url(),
        status = response.status,
        redirected = response.redirected,
        "Not caching response"
      );
      return;
    }

    if let Err(e) = self.storage.put_entry(partition, key, response) {
      tracing::warn!(partition, url = key.url(), error = %e, "Cache write failed");
    }
  }

  /// Fire-and-forget refresh. Not awaited, not cancelled, errors dropped.
  fn revalidate_in_background(&self, partition: String, key: RequestKey, request: Request) {
    let storage = Arc::clone(&self.storage);
    let fetch = self.network.fetch(request);

    tokio::spawn(async move {
      match fetch.await {
        Ok(response) if response.is_cacheable() => {
          if let Err(e) = storage.put_entry(&partition, &key, &response) {
            tracing::debug!(url = key.url(), error = %e, "Background refresh not stored");
          }
        }
        Ok(response) => {
          tracing::debug!(url = key.url(), status = response.status, "Background refresh skipped");
        }
        Err(e) => {
          tracing::debug!(url = key.url(), error = %e, "Background refresh failed");
        }
      }
    });
  }
}

impl<S: CacheStorage, N: Network> Clone for StrategyExecutor<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      partitions: self.partitions.clone(),
      vary_headers: self.vary_headers.clone(),
      app_root: self.app_root.clone(),
    }
  }
}

/// Returned by cache-first and stale-while-revalidate when the network is down.
fn network_error_response() -> Response {
  Response::text(408, "Network error happened")
}

pub(crate) fn offline_api_response() -> Response {
  Response::json(
    503,
    &serde_json::json!({
      "error": "Offline",
      "message": "This feature is not available offline"
    }),
  )
}

fn offline_page() -> Response {
  Response::html(200, OFFLINE_PAGE)
}

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Offline</title>
  <style>
    body { font-family: system-ui, sans-serif; display: flex; align-items: center;
           justify-content: center; min-height: 100vh; margin: 0; text-align: center; }
    button { padding: 0.6rem 1.4rem; font-size: 1rem; cursor: pointer; }
  </style>
</head>
<body>
  <main>
    <h1>You are offline</h1>
    <p>Check your connection and try again.</p>
    <button onclick="window.location.reload()">Retry</button>
  </main>
</body>
</html>
"#;
