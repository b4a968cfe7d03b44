use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the hosted data store (PostgREST-style REST endpoint)
  pub url: String,
  /// Table holding product rows
  #[serde(default = "default_products_table")]
  pub products_table: String,
  /// Table receiving sale rows
  #[serde(default = "default_sales_table")]
  pub sales_table: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Row budget for the local product store; eviction keeps the store under it
  #[serde(default = "default_max_cached_products")]
  pub max_cached_products: u64,
  /// Delta window: a non-forced sync younger than this only pulls changes
  #[serde(default = "default_sync_window_secs")]
  pub sync_window_secs: u64,
  /// Batch size above which a sync pass triggers an opportunistic optimize
  #[serde(default = "default_optimize_batch_threshold")]
  pub optimize_batch_threshold: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Base delay for drain retry backoff (multiplied by the attempt count)
  #[serde(default = "default_retry_base_delay_ms")]
  pub retry_base_delay_ms: u64,
  /// Attempts per drain pass before an entry is parked as failed
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
  /// Quiet period after a local mutation before a push is attempted
  #[serde(default = "default_push_debounce_ms")]
  pub push_debounce_ms: u64,
  /// Minimum age of the product cache before a periodic pull runs
  #[serde(default = "default_pull_interval_secs")]
  pub pull_interval_secs: u64,
  /// How often the periodic loop wakes up to check pull/drain conditions
  #[serde(default = "default_check_interval_secs")]
  pub check_interval_secs: u64,
}

fn default_products_table() -> String {
  "products".to_string()
}

fn default_sales_table() -> String {
  "sales".to_string()
}

fn default_max_cached_products() -> u64 {
  5000
}

fn default_sync_window_secs() -> u64 {
  6 * 60 * 60
}

fn default_optimize_batch_threshold() -> usize {
  100
}

fn default_retry_base_delay_ms() -> u64 {
  1000
}

fn default_max_retries() -> u32 {
  3
}

fn default_push_debounce_ms() -> u64 {
  2000
}

fn default_pull_interval_secs() -> u64 {
  15 * 60
}

fn default_check_interval_secs() -> u64 {
  5 * 60
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_cached_products: default_max_cached_products(),
      sync_window_secs: default_sync_window_secs(),
      optimize_batch_threshold: default_optimize_batch_threshold(),
    }
  }
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      retry_base_delay_ms: default_retry_base_delay_ms(),
      max_retries: default_max_retries(),
    }
  }
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      push_debounce_ms: default_push_debounce_ms(),
      pull_interval_secs: default_pull_interval_secs(),
      check_interval_secs: default_check_interval_secs(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tillsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tillsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/tillsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tillsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tillsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the remote store API key from environment variables.
  ///
  /// Checks TILLSYNC_API_KEY first, then POS_API_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("TILLSYNC_API_KEY")
      .or_else(|_| std::env::var("POS_API_KEY"))
      .map_err(|_| {
        eyre!("Remote API key not found. Set TILLSYNC_API_KEY or POS_API_KEY environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_fill_missing_sections() {
    let yaml = "remote:\n  url: https://store.example.com\n";
    let config: Config = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.remote.products_table, "products");
    assert_eq!(config.cache.max_cached_products, 5000);
    assert_eq!(config.cache.sync_window_secs, 6 * 60 * 60);
    assert_eq!(config.queue.max_retries, 3);
    assert_eq!(config.scheduler.push_debounce_ms, 2000);
  }

  #[test]
  fn test_explicit_values_override_defaults() {
    let yaml = r#"
remote:
  url: https://store.example.com
  products_table: inventory
cache:
  max_cached_products: 100
queue:
  retry_base_delay_ms: 50
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.remote.products_table, "inventory");
    assert_eq!(config.cache.max_cached_products, 100);
    assert_eq!(config.queue.retry_base_delay_ms, 50);
    // untouched sections still defaulted
    assert_eq!(config.scheduler.pull_interval_secs, 15 * 60);
  }
}
