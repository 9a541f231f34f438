//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::key::RequestKey;
use super::traits::CachedResponse;
use crate::http::Response;

/// Trait for cache storage backends.
///
/// Partitions must be opened before entries can be written into them.
pub trait CacheStorage: Send + Sync {
  /// Create the partition if it does not exist yet.
  fn open_partition(&self, name: &str) -> Result<()>;

  /// Delete a partition and all of its entries. Returns false if it did not exist.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Names of all existing partitions, sorted.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Number of entries in a partition.
  fn entry_count(&self, partition: &str) -> Result<usize>;

  /// Exact-key lookup within a single partition.
  fn match_entry(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any previous entry for the same key.
  fn put_entry(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Cache version that last completed activation.
  fn active_version(&self) -> Result<Option<String>>;

  fn set_active_version(&self, version: &str) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - every lookup misses and writes are dropped.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn open_partition(&self, _name: &str) -> Result<()> {
    Ok(())
  }

  fn delete_partition(&self, _name: &str) -> Result<bool> {
    Ok(false)
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn entry_count(&self, _partition: &str) -> Result<usize> {
    Ok(0)
  }

  fn match_entry(&self, _partition: &str, _key: &RequestKey) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn put_entry(&self, _partition: &str, _key: &RequestKey, _response: &Response) -> Result<()> {
    Ok(()) // Discard
  }

  fn active_version(&self) -> Result<Option<String>> {
    Ok(None)
  }

  fn set_active_version(&self, _version: &str) -> Result<()> {
    Ok(()) // Discard
  }
}

/// SQLite-based storage for cache partitions and pending submissions.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    tracing::debug!(path = %path.display(), "Opened cache database");
    Self::with_connection(conn)
  }

  /// Open a private database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named, versioned cache partitions
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request identity
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, entry_key)
);

-- Writes that could not reach the network, replayed on sync
CREATE TABLE IF NOT EXISTS pending_submissions (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn open_partition(&self, name: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;

    Ok(())
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    let count: i64 = self
      .lock()?
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", partition, e))?;

    Ok(count as usize)
  }

  fn match_entry(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE partition = ? AND entry_key = ?",
        params![partition, key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;

        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
            redirected: false,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_entry(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let conn = self.lock()?;

    let exists: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM partitions WHERE name = ?",
        params![partition],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up partition {}: {}", partition, e))?;
    if exists.is_none() {
      return Err(eyre!("Cache partition {} is not open", partition));
    }

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (partition, entry_key, method, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          partition,
          key.hash(),
          key.method(),
          key.url(),
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn active_version(&self) -> Result<Option<String>> {
    self
      .lock()?
      .query_row(
        "SELECT value FROM meta WHERE key = 'active_version'",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active version: {}", e))
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('active_version', ?)",
        params![version],
      )
      .map_err(|e| eyre!("Failed to record active version: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Request;
  use url::Url;

  fn key(url: &str) -> RequestKey {
    RequestKey::for_request(&Request::get(Url::parse(url).unwrap()), &[])
  }

  #[test]
  fn test_put_requires_open_partition() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let result = storage.put_entry(
      "static-cache-v1",
      &key("https://example.com/app.js"),
      &Response::text(200, "x"),
    );
    assert!(result.is_err());
  }

  #[test]
  fn test_put_then_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_partition("static-cache-v1").unwrap();

    let k = key("https://example.com/app.js");
    let response = Response::text(200, "console.log(1)");
    storage.put_entry("static-cache-v1", &k, &response).unwrap();

    let cached = storage.match_entry("static-cache-v1", &k).unwrap().unwrap();
    assert_eq!(cached.response.status, 200);
    assert_eq!(cached.response.body, b"console.log(1)");
    assert_eq!(
      cached.response.header("content-type"),
      Some("text/plain; charset=utf-8")
    );
  }

  #[test]
  fn test_put_replaces_previous_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_partition("image-cache-v1").unwrap();

    let k = key("https://example.com/logo.png");
    storage
      .put_entry("image-cache-v1", &k, &Response::new(200, "old"))
      .unwrap();
    storage
      .put_entry("image-cache-v1", &k, &Response::new(200, "new"))
      .unwrap();

    let cached = storage.match_entry("image-cache-v1", &k).unwrap().unwrap();
    assert_eq!(cached.response.body, b"new");
    assert_eq!(storage.entry_count("image-cache-v1").unwrap(), 1);
  }

  #[test]
  fn test_lookup_does_not_cross_partitions() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_partition("static-cache-v1").unwrap();
    storage.open_partition("dynamic-cache-v1").unwrap();

    let k = key("https://example.com/api/teams");
    storage
      .put_entry("dynamic-cache-v1", &k, &Response::new(200, "[]"))
      .unwrap();

    assert!(storage.match_entry("static-cache-v1", &k).unwrap().is_none());
    assert!(storage.match_entry("dynamic-cache-v1", &k).unwrap().is_some());
  }

  #[test]
  fn test_delete_partition_removes_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_partition("static-cache-v0").unwrap();
    let k = key("https://example.com/app.css");
    storage
      .put_entry("static-cache-v0", &k, &Response::new(200, "body{}"))
      .unwrap();

    assert!(storage.delete_partition("static-cache-v0").unwrap());
    assert!(!storage.delete_partition("static-cache-v0").unwrap());
    assert!(storage.partition_names().unwrap().is_empty());
    assert_eq!(storage.entry_count("static-cache-v0").unwrap(), 0);
  }

  #[test]
  fn test_active_version_round_trip() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.active_version().unwrap(), None);
    storage.set_active_version("v3").unwrap();
    assert_eq!(storage.active_version().unwrap().as_deref(), Some("v3"));
  }

  #[test]
  fn test_noop_storage_never_hits() {
    let storage = NoopStorage;
    let k = key("https://example.com/app.js");
    storage.open_partition("static-cache-v1").unwrap();
    storage
      .put_entry("static-cache-v1", &k, &Response::text(200, "x"))
      .unwrap();

    assert!(storage.match_entry("static-cache-v1", &k).unwrap().is_none());
    assert!(storage.partition_names().unwrap().is_empty());
    storage.set_active_version("v1").unwrap();
    assert_eq!(storage.active_version().unwrap(), None);
  }
}
