//! Test helpers: a scripted network and URL shorthands.

use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::http::{Network, Request, Response};

const ORIGIN: &str = "https://hack.example";

/// Resolve a path against the test origin.
pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

#[derive(Default)]
struct MockState {
  routes: HashMap<String, Response>,
  failing: Vec<String>,
  offline: bool,
  calls: Vec<Request>,
}

/// Network that answers from a route table. Unknown URLs get a 404.
///
/// Clones share state, so a test can keep one handle and give another to
/// the code under test.
#[derive(Clone, Default)]
pub struct MockNetwork {
  state: Arc<Mutex<MockState>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, path: &str, response: Response) {
    let mut state = self.state.lock().unwrap();
    state.routes.insert(url(path).to_string(), response);
  }

  /// Make requests to `path` fail at the transport level.
  pub fn fail(&self, path: &str) {
    self.state.lock().unwrap().failing.push(url(path).to_string());
  }

  pub fn set_offline(&self, offline: bool) {
    self.state.lock().unwrap().offline = offline;
  }

  pub fn calls(&self) -> Vec<Request> {
    self.state.lock().unwrap().calls.clone()
  }

  pub fn call_count(&self, path: &str) -> usize {
    let target = url(path);
    self
      .state
      .lock()
      .unwrap()
      .calls
      .iter()
      .filter(|r| r.url == target)
      .count()
  }
}

impl Network for MockNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
    let mut state = self.state.lock().unwrap();
    state.calls.push(request.clone());

    let key = request.url.to_string();
    let result = if state.offline || state.failing.contains(&key) {
      Err(eyre!("network unreachable: {}", key))
    } else {
      Ok(
        state
          .routes
          .get(&key)
          .cloned()
          .unwrap_or_else(|| Response::text(404, "Not Found")),
      )
    };

    future::ready(result).boxed()
  }
}
