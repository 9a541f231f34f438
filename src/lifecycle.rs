//! Cache partition lifecycle: install, activate, claim.
//!
//! ```text
//! Idle -> Installing -> Installed -> Activating -> Active
//! ```
//!
//! Install opens the current partitions and precaches the manifest on a
//! best-effort basis, then skips the waiting phase. Activate deletes every
//! partition that is not current and claims clients. There is no explicit
//! deactivation; a later version's activation supersedes this one.

use color_eyre::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache::{CacheStorage, PartitionNames, Purpose, RequestKey};
use crate::http::{Network, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Idle,
  Installing,
  /// Installed and waiting to activate
  Installed,
  Activating,
  Active,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
  pub precached: Vec<Url>,
  pub failed: Vec<PrecacheFailure>,
  /// Always set: activation follows install without waiting for clients
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrecacheFailure {
  pub url: Url,
  pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivateReport {
  /// Stale partitions removed during cleanup
  pub deleted: Vec<String>,
  pub clients_claimed: bool,
}

pub struct LifecycleManager<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  partitions: PartitionNames,
  version: String,
  manifest: Vec<Url>,
  vary_headers: Vec<String>,
  state: Mutex<LifecycleState>,
}

impl<S: CacheStorage, N: Network> LifecycleManager<S, N> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    version: &str,
    manifest: Vec<Url>,
    vary_headers: Vec<String>,
  ) -> Self {
    Self {
      storage,
      network,
      partitions: PartitionNames::for_version(version),
      version: version.to_string(),
      manifest,
      vary_headers,
      state: Mutex::new(LifecycleState::Idle),
    }
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, next: LifecycleState) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    tracing::debug!(from = ?*state, to = ?next, "Lifecycle transition");
    *state = next;
  }

  /// Whether fetches are intercepted. Before activation claims clients,
  /// requests go straight to the network.
  pub fn is_controlling(&self) -> bool {
    self.state() == LifecycleState::Active
  }

  pub fn partitions(&self) -> &PartitionNames {
    &self.partitions
  }

  /// Resume a version that already completed activation in an earlier run.
  ///
  /// Returns true when the stored active version matches this one and all of
  /// its partitions still exist.
  pub fn resume(&self) -> Result<bool> {
    if self.storage.active_version()?.as_deref() != Some(self.version.as_str()) {
      return Ok(false);
    }

    let existing = self.storage.partition_names()?;
    let complete = self
      .partitions
      .all()
      .iter()
      .all(|name| existing.iter().any(|e| e == name));

    if complete {
      tracing::info!(version = %self.version, "Resuming active cache version");
      self.set_state(LifecycleState::Active);
    }
    Ok(complete)
  }

  /// Open the current partitions and precache the manifest.
  ///
  /// Precache failures are logged and reported; they never fail the install.
  pub async fn install(&self) -> Result<InstallReport> {
    self.set_state(LifecycleState::Installing);
    tracing::info!(version = %self.version, "Installing");

    for name in self.partitions.all() {
      self.storage.open_partition(name)?;
    }

    let static_partition = self.partitions.name(Purpose::Static);
    let mut precached = Vec::new();
    let mut failed = Vec::new();

    for url in &self.manifest {
      let request = Request::get(url.clone());
      let key = RequestKey::for_request(&request, &self.vary_headers);

      let outcome = match self.network.fetch(request).await {
        Ok(response) if response.is_cacheable() => self
          .storage
          .put_entry(static_partition, &key, &response)
          .map_err(|e| e.to_string()),
        Ok(response) => Err(format!("HTTP {}", response.status)),
        Err(e) => Err(e.to_string()),
      };

      match outcome {
        Ok(()) => precached.push(url.clone()),
        Err(reason) => {
          tracing::warn!(url = %url, reason = %reason, "Precache failed");
          failed.push(PrecacheFailure {
            url: url.clone(),
            reason,
          });
        }
      }
    }

    self.set_state(LifecycleState::Installed);
    tracing::info!(
      precached = precached.len(),
      failed = failed.len(),
      "Installed, skipping wait"
    );

    Ok(InstallReport {
      precached,
      failed,
      skip_waiting: true,
    })
  }

  /// Delete stale partitions, record the active version and claim clients.
  ///
  /// Activating from `Idle` installs first.
  pub async fn activate(&self) -> Result<ActivateReport> {
    if self.state() == LifecycleState::Idle {
      self.install().await?;
    }

    self.set_state(LifecycleState::Activating);

    let mut deleted = Vec::new();
    for name in self.storage.partition_names()? {
      if !self.partitions.contains(&name) {
        if self.storage.delete_partition(&name)? {
          tracing::info!(partition = %name, "Deleted stale partition");
        }
        deleted.push(name);
      }
    }

    self.storage.set_active_version(&self.version)?;
    self.set_state(LifecycleState::Active);
    tracing::info!(version = %self.version, "Activated, clients claimed");

    Ok(ActivateReport {
      deleted,
      clients_claimed: true,
    })
  }
}
