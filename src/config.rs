use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::invalidation::BatchConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Project URL, e.g. `https://xyz.supabase.co`
  pub url: String,
  /// Database schema sent as `Accept-Profile`/`Content-Profile` (defaults to `public`)
  pub schema: Option<String>,
  /// Profile whose reading queue the client manages
  pub profile_id: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long a fetched value is served without a network read
  pub stale_time_secs: u64,
  pub key_debounce_ms: u64,
  pub operation_debounce_ms: u64,
  pub page_size: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 300,
      key_debounce_ms: 100,
      operation_debounce_ms: 200,
      page_size: 25,
    }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(self.stale_time_secs).unwrap_or(i64::MAX / 1000))
  }

  pub fn batch_config(&self) -> BatchConfig {
    BatchConfig {
      key_debounce: Duration::from_millis(self.key_debounce_ms),
      operation_debounce: Duration::from_millis(self.operation_debounce_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive; `RUST_LOG` takes precedence
  pub level: String,
  /// Write daily-rotated log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./letterbox.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/letterbox/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    match explicit_path {
      Some(path) if !path.exists() => Err(eyre!("Config file not found: {}", path.display())),
      Some(path) => Self::load_from_path(path),
      None => match Self::find_config_file() {
        Some(path) => Self::load_from_path(&path),
        None => Err(eyre!(
          "No configuration file found. Create one at ~/.config/letterbox/config.yaml \
           (see config.example.yaml for the format)"
        )),
      },
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("letterbox.yaml");
    if local.exists() {
      return Some(local);
    }

    dirs::config_dir()
      .map(|dir| dir.join("letterbox").join("config.yaml"))
      .filter(|path| path.exists())
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.backend.url.trim().is_empty() {
      return Err(eyre!("backend.url must not be empty"));
    }
    if config.backend.profile_id.trim().is_empty() {
      return Err(eyre!("backend.profile_id must not be empty"));
    }
    if config.cache.page_size == 0 {
      return Err(eyre!("cache.page_size must be at least 1"));
    }
    Ok(config)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks LETTERBOX_API_TOKEN first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("LETTERBOX_API_TOKEN")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("API token not found. Set LETTERBOX_API_TOKEN or SUPABASE_ANON_KEY environment variable.")
      })
  }
}
