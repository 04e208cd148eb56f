//! Configuration loader plus strongly typed settings structures.
//!
//! One TOML file (`config.toml`) in the data directory. The embedded
//! default is written on first run; every field has a serde default so a
//! partial file still loads.

use crate::data::Size;
use crate::store::StoreSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Embed default configuration at compile time
const DEFAULT_CONFIG: &str = include_str!("../defaults/config.toml");

pub const DEFAULT_HUB_ADDRESS: &str = "http://homeassistant.local:8123";

/// Data directory override
pub const DIR_ENV: &str = "FLOORPLAN_DIR";
pub const HUB_ADDRESS_ENV: &str = "FLOORPLAN_HUB_ADDRESS";
pub const HUB_TOKEN_ENV: &str = "FLOORPLAN_HUB_TOKEN";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_hub_poll_secs")]
    pub poll_interval_secs: u64, // Only while the live feed is down
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_cloud_poll_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_ui_debounce_ms")]
    pub ui_debounce_ms: u64,
    #[serde(default = "default_widget_size")]
    pub default_size: Size,
    #[serde(default = "default_cache_file")]
    pub cache_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiConfig {
    #[serde(default = "default_event_log_size")]
    pub event_log_size: usize,
    #[serde(default = "default_toast_duration_ms")]
    pub toast_duration_ms: u64,
}

fn default_hub_poll_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_cloud_poll_secs() -> u64 {
    5
}

fn default_debounce_ms() -> u64 {
    600
}

fn default_ui_debounce_ms() -> u64 {
    1000
}

fn default_widget_size() -> Size {
    Size {
        width: 80.0,
        height: 40.0,
    }
}

fn default_cache_file() -> String {
    "local_cache.json".to_string()
}

fn default_event_log_size() -> usize {
    crate::notify::DEFAULT_LOG_SIZE
}

fn default_toast_duration_ms() -> u64 {
    crate::notify::DEFAULT_TOAST_MS
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            access_token: String::new(),
            poll_interval_secs: default_hub_poll_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            api_key: None,
            poll_interval_secs: default_cloud_poll_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            ui_debounce_ms: default_ui_debounce_ms(),
            default_size: default_widget_size(),
            cache_file: default_cache_file(),
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            event_log_size: default_event_log_size(),
            toast_duration_ms: default_toast_duration_ms(),
        }
    }
}

impl Config {
    /// Load `config.toml` from the data directory, writing the default first
    /// if it doesn't exist
    pub fn load() -> Result<Self> {
        let dir = Self::base_dir()?;
        fs::create_dir_all(&dir).context(format!("Failed to create data directory: {:?}", dir))?;

        let config_path = dir.join("config.toml");
        if !config_path.exists() {
            fs::write(&config_path, DEFAULT_CONFIG).context("Failed to write config.toml")?;
            tracing::info!("Extracted config.toml to {:?}", config_path);
        }

        let mut config = Self::load_from_path(&config_path)?;
        config.apply_env_fallbacks(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&contents).context(format!("Failed to parse config file: {:?}", path))
    }

    /// Fill empty hub settings from the environment, then the built-in default
    pub fn apply_env_fallbacks(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let from_env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if self.hub.address.trim().is_empty() {
            self.hub.address = from_env(HUB_ADDRESS_ENV).unwrap_or_else(|| DEFAULT_HUB_ADDRESS.to_string());
        }
        if self.hub.access_token.trim().is_empty() {
            if let Some(token) = from_env(HUB_TOKEN_ENV) {
                self.hub.access_token = token;
            }
        }
    }

    /// Get the base floorplan directory (~/.floorplan/)
    /// Can be overridden with FLOORPLAN_DIR environment variable
    pub fn base_dir() -> Result<PathBuf> {
        if let Ok(custom_dir) = std::env::var(DIR_ENV) {
            return Ok(PathBuf::from(custom_dir));
        }

        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".floorplan"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    /// Local cache file; relative names live in the data directory
    pub fn cache_path(&self) -> Result<PathBuf> {
        Ok(Self::base_dir()?.join(&self.store.cache_file))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("floorplan.log"))
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            debounce: Duration::from_millis(self.store.debounce_ms),
            ui_debounce: Duration::from_millis(self.store.ui_debounce_ms),
            default_size: self.store.default_size,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.hub.request_timeout_secs.max(1))
    }

    /// Ask for the hub token on the terminal when none is configured
    pub fn prompt_token(&mut self) -> Result<()> {
        if !self.hub.access_token.trim().is_empty() {
            return Ok(());
        }
        let token = rpassword::prompt_password(format!("Access token for {}: ", self.hub.address))
            .context("Failed to read access token")?;
        self.hub.access_token = token.trim().to_string();
        Ok(())
    }

    /// Problems that would stop the dashboard working; empty means usable
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        match url::Url::parse(&self.hub.address) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => issues.push(format!("hub.address: unsupported scheme {:?}", url.scheme())),
            Err(e) => issues.push(format!("hub.address {:?}: {}", self.hub.address, e)),
        }
        if self.hub.access_token.trim().is_empty() {
            issues.push(format!("hub.access_token is empty (set it or {})", HUB_TOKEN_ENV));
        }
        if self.cloud.enabled {
            if let Err(e) = url::Url::parse(&self.cloud.endpoint) {
                issues.push(format!("cloud.endpoint {:?}: {}", self.cloud.endpoint, e));
            }
        }
        if self.store.cache_file.trim().is_empty() {
            issues.push("store.cache_file is empty".to_string());
        }
        if self.store.debounce_ms == 0 {
            issues.push("store.debounce_ms must be greater than 0".to_string());
        }
        issues
    }
}
