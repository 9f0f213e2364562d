use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::TierName;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the application; same-origin writes are eligible for deferred sync
  pub origin: Url,
  /// Cache version token. Changing it discards every tier of older versions.
  pub version: String,
  /// Reserved file name token of the compiled binary module
  pub module_name: String,
  /// Override for the data directory holding the database and logs
  pub data_dir: Option<PathBuf>,
  /// App-shell paths fetched and stored on install
  pub precache: Vec<String>,
  pub storage: StorageConfig,
  pub tiers: BTreeMap<TierName, TierOverride>,
  pub network: NetworkConfig,
  pub queue: QueueConfig,
  pub ai: AiConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:8080").expect("static origin parses"),
      version: "v1".to_string(),
      module_name: "writemagic_wasm".to_string(),
      data_dir: None,
      precache: ["/", "/index.html", "/offline.html", "/manifest.json"]
        .into_iter()
        .map(String::from)
        .collect(),
      storage: StorageConfig::default(),
      tiers: BTreeMap::new(),
      network: NetworkConfig::default(),
      queue: QueueConfig::default(),
      ai: AiConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Total byte quota across all tiers and queues
  pub quota_bytes: u64,
  /// Usage ratio that triggers a warning and cleanup
  pub warning_ratio: f64,
  pub cleanup_interval_secs: u64,
  /// Writes at least this large schedule an early cleanup pass
  pub large_write_bytes: u64,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      quota_bytes: 100 * 1024 * 1024,
      warning_ratio: 0.8,
      cleanup_interval_secs: 300,
      large_write_bytes: 1024 * 1024,
    }
  }
}

/// Per-tier policy overrides; unset fields keep the built-in value.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct TierOverride {
  pub max_age_secs: Option<u64>,
  pub max_entries: Option<usize>,
  pub quota_bytes: Option<u64>,
  pub min_retention_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// URL fetched by the latency probe; defaults to the origin root
  pub probe_url: Option<Url>,
  pub probe_interval_secs: u64,
  /// Multiplier applied to every category timeout
  pub timeout_scale: f64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 30,
      timeout_scale: 1.0,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub max_retries: u32,
  pub max_age_secs: u64,
  /// How often pending queues are retried while online
  pub sync_interval_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      max_age_secs: 7 * 24 * 60 * 60,
      sync_interval_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
  /// Query parameters that distinguish one AI response from another
  #[serde(deserialize_with = "deserialize_lowercase_list")]
  pub cache_key_params: Vec<String>,
}

impl Default for AiConfig {
  fn default() -> Self {
    Self {
      cache_key_params: ["model", "prompt", "temperature", "max_tokens", "provider"]
        .into_iter()
        .map(String::from)
        .collect(),
    }
  }
}

fn deserialize_lowercase_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
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
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if !(0.0..=1.0).contains(&self.storage.warning_ratio) {
      return Err(eyre!(
        "storage.warning_ratio must be between 0 and 1, got {}",
        self.storage.warning_ratio
      ));
    }
    if self.network.timeout_scale <= 0.0 {
      return Err(eyre!("network.timeout_scale must be positive"));
    }
    for (name, secs) in [
      ("network.probe_interval_secs", self.network.probe_interval_secs),
      ("storage.cleanup_interval_secs", self.storage.cleanup_interval_secs),
      ("queue.sync_interval_secs", self.queue.sync_interval_secs),
    ] {
      if secs == 0 {
        return Err(eyre!("{} must be at least 1", name));
      }
    }
    Ok(())
  }

  /// Directory holding the database and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offgrid"))
  }

  /// URL probed for connectivity and latency.
  pub fn probe_url(&self) -> Url {
    self
      .network
      .probe_url
      .clone()
      .unwrap_or_else(|| self.origin.clone())
  }

  /// Resolve a precache path or absolute URL against the origin.
  pub fn resolve(&self, path_or_url: &str) -> Result<Url> {
    self
      .origin
      .join(path_or_url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path_or_url, e))
  }
}
