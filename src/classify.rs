//! Request classification.
//!
//! Every intercepted request maps to exactly one [`Category`], which picks the
//! caching strategy. Classification never fails: a request that matches no
//! pattern is a navigation.

use serde::Serialize;

use crate::config::RoutePatterns;
use crate::http::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
  /// Scripts, stylesheets and other build assets (cache-first)
  Static,
  /// Raster and vector images (stale-while-revalidate)
  Image,
  /// Application data endpoints (network-first)
  Api,
  /// Page loads (network, then cached root document, then offline page)
  Navigation,
  /// Not intercepted: non-GET or non-http(s)
  Skip,
}

#[derive(Debug, Clone)]
pub struct Classifier {
  static_paths: Vec<String>,
  static_extensions: Vec<String>,
  image_extensions: Vec<String>,
  api_paths: Vec<String>,
}

impl Classifier {
  pub fn new(patterns: &RoutePatterns) -> Self {
    Self {
      static_paths: patterns.static_paths.clone(),
      static_extensions: dotted(&patterns.static_extensions),
      image_extensions: dotted(&patterns.image_extensions),
      api_paths: patterns.api_paths.clone(),
    }
  }

  /// First match wins: static, image, API, then navigation.
  pub fn classify(&self, request: &Request) -> Category {
    if !request.is_get() || !request.is_http() {
      return Category::Skip;
    }

    let path = request.url.path();
    let lower = path.to_ascii_lowercase();

    if self.static_paths.iter().any(|p| path.contains(p.as_str()))
      || self.static_extensions.iter().any(|e| lower.ends_with(e.as_str()))
    {
      Category::Static
    } else if self.image_extensions.iter().any(|e| lower.ends_with(e.as_str())) {
      Category::Image
    } else if self.api_paths.iter().any(|p| path.contains(p.as_str())) {
      Category::Api
    } else {
      Category::Navigation
    }
  }
}

impl Default for Classifier {
  fn default() -> Self {
    Self::new(&RoutePatterns::default())
  }
}

/// Normalize configured extensions to lowercase with a leading dot.
fn dotted(extensions: &[String]) -> Vec<String> {
  extensions
    .iter()
    .map(|e| format!(".{}", e.trim_start_matches('.').to_ascii_lowercase()))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn classify(method: &str, url: &str) -> Category {
    let request = Request::new(method, Url::parse(url).unwrap());
    Classifier::default().classify(&request)
  }

  #[test]
  fn test_non_get_is_skipped() {
    for method in ["POST", "PUT", "PATCH", "DELETE"] {
      assert_eq!(
        classify(method, "https://hack.example/api/teams"),
        Category::Skip
      );
    }
  }

  #[test]
  fn test_non_http_scheme_is_skipped() {
    assert_eq!(
      classify("GET", "chrome-extension://abcdef/content.js"),
      Category::Skip
    );
  }

  #[test]
  fn test_static_paths_and_extensions() {
    assert_eq!(
      classify("GET", "https://hack.example/assets/logo-a1b2.woff2"),
      Category::Static
    );
    assert_eq!(
      classify("GET", "https://hack.example/css/main.css"),
      Category::Static
    );
    assert_eq!(
      classify("GET", "https://hack.example/vendor.js?v=3"),
      Category::Static
    );
  }

  #[test]
  fn test_static_wins_over_image() {
    // An image under /assets/ is still a static asset
    assert_eq!(
      classify("GET", "https://hack.example/assets/hero.png"),
      Category::Static
    );
  }

  #[test]
  fn test_image_extensions_case_insensitive() {
    assert_eq!(
      classify("GET", "https://hack.example/uploads/team.PNG"),
      Category::Image
    );
    assert_eq!(
      classify("GET", "https://hack.example/avatars/u1.webp"),
      Category::Image
    );
    assert_eq!(
      classify("GET", "https://hack.example/icon.svg"),
      Category::Image
    );
  }

  #[test]
  fn test_image_wins_over_api() {
    assert_eq!(
      classify("GET", "https://hack.example/teams/7/banner.jpg"),
      Category::Image
    );
  }

  #[test]
  fn test_api_paths() {
    assert_eq!(
      classify("GET", "https://hack.example/api/submissions"),
      Category::Api
    );
    assert_eq!(
      classify("GET", "https://hack.example/hackathons/42"),
      Category::Api
    );
    assert_eq!(
      classify("GET", "https://hack.example/teams/7/members"),
      Category::Api
    );
  }

  #[test]
  fn test_everything_else_is_navigation() {
    assert_eq!(classify("GET", "https://hack.example/"), Category::Navigation);
    assert_eq!(
      classify("GET", "https://hack.example/dashboard/judge"),
      Category::Navigation
    );
  }
}
