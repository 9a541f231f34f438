//! Partitioned response cache with offline fallbacks.
//!
//! This module provides:
//! - Named, versioned cache partitions (static, dynamic, image)
//! - Request-identity keys hashed from method, URL and vary headers
//! - The caching strategies (cache-first, network-first,
//!   stale-while-revalidate, navigation fallback)
//! - A SQLite storage backend that also holds deferred submissions, and a
//!   no-op backend for running with caching disabled

mod key;
mod partition;
mod storage;
mod strategy;
mod traits;

pub use key::RequestKey;
pub use partition::{PartitionNames, Purpose};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use strategy::StrategyExecutor;
pub(crate) use strategy::offline_api_response;
pub use traits::{CachedResponse, FetchResult, ResponseSource};
