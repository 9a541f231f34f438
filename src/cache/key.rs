use sha2::{Digest, Sha256};

use crate::http::Request;

/// Identity of a request inside a cache partition.
///
/// Two requests share an entry only when method, full URL and the values of
/// every configured vary header are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  hash: String,
  method: String,
  url: String,
}

impl RequestKey {
  pub fn for_request(request: &Request, vary_headers: &[String]) -> Self {
    let mut input = format!("{}\n{}\n", request.method, request.url);
    for name in vary_headers {
      let value = request.header(name).unwrap_or_default();
      input.push_str(&format!("{}:{}\n", name.to_ascii_lowercase(), value));
    }

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());

    Self {
      hash: hex::encode(hasher.finalize()),
      method: request.method.clone(),
      url: request.url.to_string(),
    }
  }

  pub fn hash(&self) -> &str {
    &self.hash
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }
}
