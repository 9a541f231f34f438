//! Deferred submissions: writes that could not reach the network are stored
//! durably and replayed when a sync signal arrives.

use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

use crate::cache::{offline_api_response, FetchResult, NoopStorage, SqliteStorage};
use crate::http::{Network, Request, Response};

/// A write request waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSubmission {
  pub id: String,
  pub url: Url,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl PendingSubmission {
  pub fn from_request(request: &Request) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      url: request.url.clone(),
      method: request.method.clone(),
      headers: request.headers.clone(),
      body: request.body.clone(),
    }
  }

  /// The original request, verbatim.
  pub fn to_request(&self) -> Request {
    Request {
      method: self.method.clone(),
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Durable store for pending submissions.
pub trait SubmissionStore: Send + Sync {
  /// All pending submissions, oldest first.
  fn pending(&self) -> Result<Vec<PendingSubmission>>;

  /// Remove a submission. Returns false if it was already gone.
  fn delete_pending(&self, id: &str) -> Result<bool>;

  fn enqueue(&self, submission: &PendingSubmission) -> Result<()>;
}

impl SubmissionStore for SqliteStorage {
  fn pending(&self) -> Result<Vec<PendingSubmission>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body FROM pending_submissions
         ORDER BY created_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, String, String, Option<Vec<u8>>)> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .map_err(|e| eyre!("Failed to query pending submissions: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read pending submission: {}", e))?;

    // A malformed row is skipped so it cannot block the rest of the queue
    let submissions = rows
      .into_iter()
      .filter_map(|(id, url, method, headers, body)| {
        let url = match Url::parse(&url) {
          Ok(url) => url,
          Err(e) => {
            tracing::warn!(id = %id, error = %e, "Skipping submission with invalid URL");
            return None;
          }
        };
        let headers = match serde_json::from_str(&headers) {
          Ok(headers) => headers,
          Err(e) => {
            tracing::warn!(id = %id, error = %e, "Skipping submission with invalid headers");
            return None;
          }
        };

        Some(PendingSubmission {
          id,
          url,
          method,
          headers,
          body,
        })
      })
      .collect();

    Ok(submissions)
  }

  fn delete_pending(&self, id: &str) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM pending_submissions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete submission {}: {}", id, e))?;

    Ok(removed > 0)
  }

  fn enqueue(&self, submission: &PendingSubmission) -> Result<()> {
    let headers = serde_json::to_string(&submission.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .lock()?
      .execute(
        "INSERT INTO pending_submissions (id, url, method, headers, body)
         VALUES (?, ?, ?, ?, ?)",
        params![
          submission.id,
          submission.url.as_str(),
          submission.method,
          headers,
          submission.body
        ],
      )
      .map_err(|e| eyre!("Failed to store submission: {}", e))?;

    Ok(())
  }
}

impl SubmissionStore for NoopStorage {
  fn pending(&self) -> Result<Vec<PendingSubmission>> {
    Ok(Vec::new())
  }

  fn delete_pending(&self, _id: &str) -> Result<bool> {
    Ok(false)
  }

  fn enqueue(&self, _submission: &PendingSubmission) -> Result<()> {
    Err(eyre!("Deferred submissions are disabled"))
  }
}

/// Outcome of one sync trigger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
  /// Submissions that replayed with a 2xx and were removed
  pub replayed: Vec<String>,
  /// Submissions left for the next trigger
  pub remaining: Vec<String>,
}

pub struct DeferredQueue<Q: SubmissionStore, N: Network> {
  store: Arc<Q>,
  network: Arc<N>,
  tag: String,
}

impl<Q: SubmissionStore, N: Network> DeferredQueue<Q, N> {
  pub fn new(store: Arc<Q>, network: Arc<N>, tag: &str) -> Self {
    Self {
      store,
      network,
      tag: tag.to_string(),
    }
  }

  pub fn handles(&self, tag: &str) -> bool {
    self.tag == tag
  }

  /// Replay every pending submission once, in order.
  ///
  /// Only a 2xx replay removes a record; anything else leaves it for the
  /// next trigger. One failure does not stop the rest.
  pub async fn replay(&self) -> Result<SyncReport> {
    let pending = self.store.pending()?;
    let mut report = SyncReport::default();

    tracing::info!(count = pending.len(), "Replaying pending submissions");

    for submission in pending {
      match self.network.fetch(submission.to_request()).await {
        Ok(response) if response.is_success() => {
          match self.store.delete_pending(&submission.id) {
            Ok(_) => report.replayed.push(submission.id),
            Err(e) => {
              tracing::error!(id = %submission.id, error = %e, "Replayed but could not dequeue");
              report.remaining.push(submission.id);
            }
          }
        }
        Ok(response) => {
          tracing::warn!(
            id = %submission.id,
            url = %submission.url,
            status = response.status,
            "Replay rejected, keeping submission"
          );
          report.remaining.push(submission.id);
        }
        Err(e) => {
          tracing::info!(id = %submission.id, error = %e, "Replay failed, keeping submission");
          report.remaining.push(submission.id);
        }
      }
    }

    Ok(report)
  }

  /// Send a write straight to the network; if the network is unreachable,
  /// store it for replay and answer with `202 Accepted`. A store that cannot
  /// take the write gets the offline `503` instead.
  pub async fn submit(&self, request: Request) -> Result<FetchResult> {
    match self.network.fetch(request.clone()).await {
      Ok(response) => Ok(FetchResult::from_network(response)),
      Err(e) => {
        let submission = PendingSubmission::from_request(&request);
        if let Err(store_err) = self.store.enqueue(&submission) {
          tracing::warn!(
            url = %submission.url,
            error = %store_err,
            "Offline and could not queue submission"
          );
          return Ok(FetchResult::fallback(offline_api_response()));
        }
        tracing::info!(
          id = %submission.id,
          url = %submission.url,
          error = %e,
          "Offline, submission queued"
        );

        Ok(FetchResult::fallback(Response::json(
          202,
          &serde_json::json!({ "queued": true, "id": submission.id }),
        )))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ResponseSource;
  use crate::testing::{url, MockNetwork};

  fn queue(network: &MockNetwork) -> (Arc<SqliteStorage>, DeferredQueue<SqliteStorage, MockNetwork>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let queue = DeferredQueue::new(
      Arc::clone(&storage),
      Arc::new(network.clone()),
      "background-sync",
    );
    (storage, queue)
  }

  fn team_post() -> Request {
    Request::new("POST", url("/api/teams"))
      .with_header("content-type", "application/json")
      .with_body(r#"{"name":"Rustaceans"}"#)
  }

  #[test]
  fn test_store_round_trip_preserves_request() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let submission = PendingSubmission::from_request(&team_post());
    storage.enqueue(&submission).unwrap();

    let pending = storage.pending().unwrap();
    assert_eq!(pending, vec![submission.clone()]);
    assert_eq!(pending[0].to_request(), team_post());

    assert!(storage.delete_pending(&submission.id).unwrap());
    assert!(!storage.delete_pending(&submission.id).unwrap());
  }

  #[tokio::test]
  async fn test_submit_offline_queues() {
    let network = MockNetwork::new();
    network.set_offline(true);
    let (storage, queue) = queue(&network);

    let result = queue.submit(team_post()).await.unwrap();

    assert_eq!(result.source, ResponseSource::Fallback);
    assert_eq!(result.response.status, 202);
    assert_eq!(storage.pending().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_submit_online_does_not_queue() {
    let network = MockNetwork::new();
    network.respond("/api/teams", Response::new(201, "created"));
    let (storage, queue) = queue(&network);

    let result = queue.submit(team_post()).await.unwrap();

    assert_eq!(result.response.status, 201);
    assert!(storage.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_replay_removes_only_after_success() {
    let network = MockNetwork::new();
    network.set_offline(true);
    let (storage, queue) = queue(&network);
    queue.submit(team_post()).await.unwrap();

    // Still offline: one attempt per trigger, record kept
    let report = queue.replay().await.unwrap();
    assert!(report.replayed.is_empty());
    assert_eq!(report.remaining.len(), 1);
    assert_eq!(storage.pending().unwrap().len(), 1);

    network.set_offline(false);
    network.respond("/api/teams", Response::new(201, "created"));
    let before = network.call_count("/api/teams");

    let report = queue.replay().await.unwrap();
    assert_eq!(report.replayed.len(), 1);
    assert!(storage.pending().unwrap().is_empty());
    assert_eq!(network.call_count("/api/teams"), before + 1);

    // Replayed verbatim
    let last = network.calls().pop().unwrap();
    assert_eq!(last, team_post());
  }

  #[tokio::test]
  async fn test_replay_keeps_rejected_submission() {
    let network = MockNetwork::new();
    network.set_offline(true);
    let (storage, queue) = queue(&network);
    queue.submit(team_post()).await.unwrap();

    network.set_offline(false);
    network.respond("/api/teams", Response::new(500, "server error"));

    let report = queue.replay().await.unwrap();
    assert_eq!(report.remaining.len(), 1);
    assert_eq!(storage.pending().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_one_failure_does_not_block_the_next() {
    let network = MockNetwork::new();
    network.set_offline(true);
    let (storage, queue) = queue(&network);
    queue
      .submit(Request::new("POST", url("/api/votes")).with_body("a"))
      .await
      .unwrap();
    queue
      .submit(Request::new("POST", url("/api/teams")).with_body("b"))
      .await
      .unwrap();

    network.set_offline(false);
    network.fail("/api/votes");
    network.respond("/api/teams", Response::new(200, "ok"));

    let before = network.calls().len();
    let report = queue.replay().await.unwrap();
    assert_eq!(report.replayed.len(), 1);
    assert_eq!(report.remaining.len(), 1);

    // Oldest first
    let replayed: Vec<Url> = network.calls()[before..].iter().map(|r| r.url.clone()).collect();
    assert_eq!(replayed, vec![url("/api/votes"), url("/api/teams")]);

    let left = storage.pending().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].url, url("/api/votes"));
  }

  #[tokio::test]
  async fn test_malformed_row_does_not_block_replay() {
    let network = MockNetwork::new();
    network.set_offline(true);
    let (storage, queue) = queue(&network);
    storage
      .lock()
      .unwrap()
      .execute(
        "INSERT INTO pending_submissions (id, url, method, headers, body)
         VALUES ('bad-url', 'not a url', 'POST', '{}', NULL),
                ('bad-headers', 'https://hack.example/api/teams', 'POST', 'oops', NULL)",
        [],
      )
      .unwrap();
    queue.submit(team_post()).await.unwrap();

    let pending = storage.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].to_request(), team_post());

    network.set_offline(false);
    network.respond("/api/teams", Response::new(201, "created"));

    let report = queue.replay().await.unwrap();
    assert_eq!(report.replayed, vec![pending[0].id.clone()]);
    assert!(report.remaining.is_empty());
  }

  #[tokio::test]
  async fn test_submit_without_store_answers_offline() {
    let network = MockNetwork::new();
    network.set_offline(true);
    let queue = DeferredQueue::new(
      Arc::new(NoopStorage),
      Arc::new(network.clone()),
      "background-sync",
    );

    let result = queue.submit(team_post()).await.unwrap();

    assert_eq!(result.source, ResponseSource::Fallback);
    assert_eq!(result.response.status, 503);
    assert!(queue.replay().await.unwrap().replayed.is_empty());
  }

  #[test]
  fn test_handles_only_configured_tag() {
    let network = MockNetwork::new();
    let (_, queue) = queue(&network);
    assert!(queue.handles("background-sync"));
    assert!(!queue.handles("periodic-refresh"));
  }
}
