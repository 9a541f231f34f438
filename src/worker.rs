//! The worker: one classifier/executor pair plus lifecycle, sync queue and
//! notification relay, driven by a single event dispatch.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use crate::cache::{CacheStorage, FetchResult, StrategyExecutor};
use crate::classify::{Category, Classifier};
use crate::config::Config;
use crate::http::{Network, Request};
use crate::lifecycle::{ActivateReport, InstallReport, LifecycleManager};
use crate::notify::{ClickOutcome, Notification, NotificationRelay};
use crate::sync::{DeferredQueue, SubmissionStore, SyncReport};

/// Events the worker reacts to.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  Sync { tag: String },
  Push { payload: Option<Vec<u8>> },
  NotificationClick {
    notification: Notification,
    action: Option<String>,
  },
}

#[derive(Debug, Clone)]
pub enum EventOutcome {
  Installed(InstallReport),
  Activated(ActivateReport),
  Fetched(FetchOutcome),
  /// `None` when the sync tag is not ours
  Synced(Option<SyncReport>),
  Notify(Option<Notification>),
  Clicked(ClickOutcome),
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not intercepted; the caller sends the request to the network itself
  Passthrough(Request),
  Handled { category: Category, result: FetchResult },
}

impl EventOutcome {
  /// JSON view of the outcome for command-line output. Response bodies are
  /// left out.
  pub fn into_json(self) -> Result<serde_json::Value> {
    let value = match self {
      Self::Installed(report) => serde_json::to_value(report),
      Self::Activated(report) => serde_json::to_value(report),
      Self::Fetched(FetchOutcome::Passthrough(request)) => Ok(serde_json::json!({
        "passthrough": request.url,
        "method": request.method,
      })),
      Self::Fetched(FetchOutcome::Handled { category, result }) => Ok(serde_json::json!({
        "category": category,
        "source": result.source,
        "status": result.response.status,
        "cached_at": result.cached_at,
      })),
      Self::Synced(report) => serde_json::to_value(report),
      Self::Notify(notification) => serde_json::to_value(notification),
      Self::Clicked(outcome) => serde_json::to_value(outcome),
    };

    value.map_err(|e| eyre!("Failed to serialize outcome: {}", e))
  }
}

pub struct Worker<S, N>
where
  S: CacheStorage + SubmissionStore + 'static,
  N: Network,
{
  classifier: Classifier,
  executor: StrategyExecutor<S, N>,
  lifecycle: LifecycleManager<S, N>,
  queue: DeferredQueue<S, N>,
  relay: NotificationRelay,
}

impl<S, N> Worker<S, N>
where
  S: CacheStorage + SubmissionStore + 'static,
  N: Network,
{
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
    let app_root = config.app_root_url()?;
    let lifecycle = LifecycleManager::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      &config.cache.version,
      config.precache_urls()?,
      config.cache.vary_headers.clone(),
    );
    let executor = StrategyExecutor::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      lifecycle.partitions().clone(),
      config.cache.vary_headers.clone(),
      app_root.clone(),
    );
    let queue = DeferredQueue::new(storage, network, &config.sync.tag);
    let relay = NotificationRelay::new(config.origin.clone(), app_root, &config.app_name);

    Ok(Self {
      classifier: Classifier::new(&config.routes),
      executor,
      lifecycle,
      queue,
      relay,
    })
  }

  pub fn lifecycle(&self) -> &LifecycleManager<S, N> {
    &self.lifecycle
  }

  /// Bring the worker to the active state: resume the stored version if it
  /// matches, otherwise install and activate.
  pub async fn start(&self) -> Result<()> {
    if self.lifecycle.resume()? {
      return Ok(());
    }
    self.lifecycle.install().await?;
    self.lifecycle.activate().await?;
    Ok(())
  }

  pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
    match event {
      WorkerEvent::Install => Ok(EventOutcome::Installed(self.lifecycle.install().await?)),
      WorkerEvent::Activate => Ok(EventOutcome::Activated(self.lifecycle.activate().await?)),
      WorkerEvent::Fetch(request) => Ok(EventOutcome::Fetched(self.fetch(request).await)),
      WorkerEvent::Sync { tag } => Ok(EventOutcome::Synced(self.sync(&tag).await?)),
      WorkerEvent::Push { payload } => {
        Ok(EventOutcome::Notify(self.relay.on_push(payload.as_deref())))
      }
      WorkerEvent::NotificationClick {
        notification,
        action,
      } => Ok(EventOutcome::Clicked(
        self.relay.on_click(&notification, action.as_deref()),
      )),
    }
  }

  /// Intercept a request. Nothing is intercepted until activation has
  /// claimed clients, and skipped requests are handed back untouched.
  pub async fn fetch(&self, request: Request) -> FetchOutcome {
    if !self.lifecycle.is_controlling() {
      return FetchOutcome::Passthrough(request);
    }

    let category = self.classifier.classify(&request);
    if category == Category::Skip {
      return FetchOutcome::Passthrough(request);
    }

    tracing::debug!(url = %request.url, ?category, "Intercepted");
    let result = self.executor.execute(category, request).await;
    FetchOutcome::Handled { category, result }
  }

  /// Answer a request end to end: intercepted requests go through their
  /// strategy, passthrough writes are queued if the network is unreachable,
  /// and everything else goes straight to the network.
  pub async fn respond(&self, request: Request) -> Result<FetchResult> {
    match self.fetch(request).await {
      FetchOutcome::Handled { result, .. } => Ok(result),
      FetchOutcome::Passthrough(request) if request.is_write() => {
        self.queue.submit(request).await
      }
      FetchOutcome::Passthrough(request) => Ok(self.executor.passthrough(request).await),
    }
  }

  async fn sync(&self, tag: &str) -> Result<Option<SyncReport>> {
    if !self.queue.handles(tag) {
      tracing::debug!(tag, "Ignoring sync for unknown tag");
      return Ok(None);
    }
    Ok(Some(self.queue.replay().await?))
  }
}
