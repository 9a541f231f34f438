//! Offline request-caching layer.
//!
//! A [`Worker`] sits between an application and its origin server and
//! decides, per request, whether to answer from a named cache partition,
//! from the network, or from a synthesized fallback. It also owns the
//! partition lifecycle, a deferred-submission queue replayed on a sync
//! signal, and a relay for server-pushed notifications.

pub mod cache;
pub mod classify;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod notify;
pub mod serve;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use worker::{EventOutcome, FetchOutcome, Worker, WorkerEvent};
