use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  /// Activate a freshly installed generation without waiting for a page to ask
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Origin the app shell is served from, e.g. "https://collect.example.org"
  pub base_url: Url,
  /// Path prefix that marks API traffic
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Path of the single-submission endpoint; the bulk endpoint is `<path>/bulk`
  #[serde(default = "default_submissions_path")]
  pub submissions_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Tag of the generation this build installs
  #[serde(default = "default_generation")]
  pub generation: String,
  /// Paths precached on install, all-or-nothing
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  /// First navigation fallback when offline; the root entry is tried after it
  #[serde(default = "default_offline_url")]
  pub offline_url: String,
  /// Request headers whose values take part in the cache key (case-insensitive)
  #[serde(default)]
  pub vary_headers: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      generation: default_generation(),
      precache: default_precache(),
      offline_url: default_offline_url(),
      vary_headers: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Pending depth at which a pass switches from single to bulk delivery
  #[serde(default = "default_batch_threshold")]
  pub batch_threshold: usize,
  /// Upper bound on records carried by one bulk call
  #[serde(default = "default_max_batch_size")]
  pub max_batch_size: usize,
  #[serde(default = "default_single_timeout")]
  pub single_timeout_secs: u64,
  #[serde(default = "default_bulk_timeout")]
  pub bulk_timeout_secs: u64,
  #[serde(default = "default_poll_interval")]
  pub poll_interval_secs: u64,
  #[serde(default = "default_true")]
  pub async_processing: bool,
  /// Background-sync tag that triggers a pass
  #[serde(default = "default_sync_tag")]
  pub background_sync_tag: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      batch_threshold: default_batch_threshold(),
      max_batch_size: default_max_batch_size(),
      single_timeout_secs: default_single_timeout(),
      bulk_timeout_secs: default_bulk_timeout(),
      poll_interval_secs: default_poll_interval(),
      async_processing: true,
      background_sync_tag: default_sync_tag(),
    }
  }
}

impl SyncConfig {
  pub fn single_timeout(&self) -> Duration {
    Duration::from_secs(self.single_timeout_secs)
  }

  pub fn bulk_timeout(&self) -> Duration {
    Duration::from_secs(self.bulk_timeout_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  #[serde(default = "default_base_delay")]
  pub base_delay_secs: u64,
  #[serde(default = "default_factor")]
  pub factor: u32,
  #[serde(default = "default_max_delay")]
  pub max_delay_secs: u64,
  /// Fraction of the delay applied as +/- jitter
  #[serde(default = "default_jitter")]
  pub jitter: f64,
  /// A record is dead-lettered once its retry count exceeds this
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      base_delay_secs: default_base_delay(),
      factor: default_factor(),
      max_delay_secs: default_max_delay(),
      jitter: default_jitter(),
      max_retries: default_max_retries(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/fieldsync/fieldsync.db)
  #[serde(default)]
  pub database: Option<PathBuf>,
  /// Hard cap on the database size
  #[serde(default)]
  pub quota_bytes: Option<u64>,
  /// Sync receipts kept for local duplicate detection; older ones are pruned
  #[serde(default = "default_receipt_limit")]
  pub receipt_limit: usize,
  /// Write daily-rolled log files here instead of stderr
  #[serde(default)]
  pub log_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      database: None,
      quota_bytes: None,
      receipt_limit: default_receipt_limit(),
      log_dir: None,
    }
  }
}

/// Longest retry delay accepted from configuration (one day)
const MAX_DELAY_SECS: u64 = 24 * 60 * 60;

fn default_true() -> bool {
  true
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_submissions_path() -> String {
  "/api/submissions".to_string()
}

fn default_generation() -> String {
  "fieldsync-v1".to_string()
}

fn default_precache() -> Vec<String> {
  ["/", "/collect", "/manifest.json"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_offline_url() -> String {
  "/collect".to_string()
}

fn default_batch_threshold() -> usize {
  2
}

fn default_max_batch_size() -> usize {
  100
}

fn default_single_timeout() -> u64 {
  30
}

fn default_bulk_timeout() -> u64 {
  60
}

fn default_poll_interval() -> u64 {
  60
}

fn default_sync_tag() -> String {
  "sync-submissions".to_string()
}

fn default_base_delay() -> u64 {
  5
}

fn default_factor() -> u32 {
  2
}

fn default_max_delay() -> u64 {
  300
}

fn default_jitter() -> f64 {
  0.2
}

fn default_max_retries() -> u32 {
  8
}

fn default_receipt_limit() -> usize {
  crate::outbox::DEFAULT_RECEIPT_LIMIT
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/fieldsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.sync.batch_threshold == 0 {
      return Err(eyre!("sync.batch_threshold must be at least 1"));
    }
    if self.sync.max_batch_size == 0 {
      return Err(eyre!("sync.max_batch_size must be at least 1"));
    }
    if !(0.0..1.0).contains(&self.retry.jitter) {
      return Err(eyre!("retry.jitter must be in [0, 1)"));
    }
    if self.retry.base_delay_secs > MAX_DELAY_SECS || self.retry.max_delay_secs > MAX_DELAY_SECS {
      return Err(eyre!(
        "retry delays must not exceed {} seconds",
        MAX_DELAY_SECS
      ));
    }
    if self.storage.receipt_limit == 0 {
      return Err(eyre!("storage.receipt_limit must be at least 1"));
    }
    if self.cache.generation.trim().is_empty() {
      return Err(eyre!("cache.generation must not be empty"));
    }
    Ok(())
  }

  /// Resolve the database path, falling back to the user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(p) = &self.storage.database {
      return Ok(p.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fieldsync").join("fieldsync.db"))
  }

  /// Resolve a path on the app origin into an absolute URL.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .server
      .base_url
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  /// Get the API bearer token from the environment, if any.
  ///
  /// Checks FIELDSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("FIELDSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
