use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the application is served from; relative paths resolve against it
  pub origin: Url,
  /// Title used for push messages that carry no title of their own
  #[serde(default = "default_app_name")]
  pub app_name: String,
  /// Path of the document served for offline navigations and default clicks
  #[serde(default = "default_app_root")]
  pub app_root: String,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub routes: RoutePatterns,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub network: NetworkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Suffix of every partition name; bump on breaking cache-format changes
  #[serde(default = "default_version")]
  pub version: String,
  /// Paths stored in the static partition at install time
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  /// Request headers that take part in the cache key
  #[serde(default)]
  pub vary_headers: Vec<String>,
  /// SQLite database path (default: $XDG_DATA_HOME/offcache/cache.db)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_version(),
      precache: default_precache(),
      vary_headers: Vec::new(),
      database: None,
    }
  }
}

/// URL patterns used by the classifier.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutePatterns {
  /// Path fragments marking static assets
  pub static_paths: Vec<String>,
  /// Path suffixes marking static assets (without the dot)
  pub static_extensions: Vec<String>,
  pub image_extensions: Vec<String>,
  /// Path fragments marking API calls
  pub api_paths: Vec<String>,
}

impl Default for RoutePatterns {
  fn default() -> Self {
    Self {
      static_paths: strings(&["/assets/", "/js/", "/css/"]),
      static_extensions: strings(&["js", "css"]),
      image_extensions: strings(&["png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "avif"]),
      api_paths: strings(&["/api/", "/hackathons/", "/teams/"]),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Sync tag that triggers replay of pending submissions
  #[serde(default = "default_sync_tag")]
  pub tag: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: default_sync_tag(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
  /// Overall request timeout; unset leaves it to the transport
  pub timeout_secs: Option<u64>,
}

impl NetworkConfig {
  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }
}

fn default_app_name() -> String {
  "Hackathon Hub".to_string()
}

fn default_app_root() -> String {
  "/".to_string()
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_precache() -> Vec<String> {
  strings(&["/", "/index.html", "/manifest.json"])
}

fn default_sync_tag() -> String {
  "background-sync".to_string()
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
  ///
  /// When no file is found, defaults are used with `origin` as the origin.
  pub fn load(explicit_path: Option<&Path>, origin: Option<&Url>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match (path, origin) {
      (Some(p), _) => Self::load_from_path(&p)?,
      (None, Some(origin)) => Self::with_origin(origin.clone()),
      (None, None) => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/offcache/config.yaml \
           or pass --origin."
        ))
      }
    };

    // Command line origin wins over the file
    if let Some(origin) = origin {
      config.origin = origin.clone();
    }

    Ok(config)
  }

  /// Default configuration for `origin`.
  pub fn with_origin(origin: Url) -> Self {
    Self {
      origin,
      app_name: default_app_name(),
      app_root: default_app_root(),
      cache: CacheConfig::default(),
      routes: RoutePatterns::default(),
      sync: SyncConfig::default(),
      network: NetworkConfig::default(),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid URL {}: {}", path, e))
  }

  pub fn app_root_url(&self) -> Result<Url> {
    self.resolve(&self.app_root)
  }

  /// Precache manifest resolved against the origin.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    self.cache.precache.iter().map(|p| self.resolve(p)).collect()
  }
}
