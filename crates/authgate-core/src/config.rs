//! Gateway configuration management.
//!
//! Configuration is stored at `~/.config/authgate/config.json` and may be
//! overridden through `AUTHGATE_*` environment variables.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_MS};
use crate::api::RetryPolicy;
use crate::auth::{FileStorage, KeyringStorage, MemoryStorage, SecretStorage};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "authgate";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// HTTP request timeout in seconds, applied to refresh calls as well.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Keyring,
    File,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub storage: StorageBackend,
    /// Keychain service / durable key namespace
    pub namespace: String,
    pub login_path: String,
    pub refresh_path: String,
    pub logout_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            storage: StorageBackend::default(),
            namespace: APP_NAME.to_string(),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            logout_path: "/auth/logout".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `AUTHGATE_BASE_URL`, `AUTHGATE_TIMEOUT_SECS` and
    /// `AUTHGATE_STORAGE` on top of the loaded values.
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("AUTHGATE_BASE_URL") {
            self.base_url = url;
        }
        if let Some(secs) = lookup("AUTHGATE_TIMEOUT_SECS") {
            self.request_timeout_secs = secs
                .parse()
                .with_context(|| format!("Invalid AUTHGATE_TIMEOUT_SECS: {}", secs))?;
        }
        if let Some(storage) = lookup("AUTHGATE_STORAGE") {
            self.storage = storage.parse()?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(&self.namespace))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.retry_delay_ms))
    }

    /// Open the durable backend selected by `storage`.
    pub fn open_storage(&self) -> Result<Arc<dyn SecretStorage>> {
        Ok(match self.storage {
            StorageBackend::Keyring => Arc::new(KeyringStorage::new(self.namespace.clone())),
            StorageBackend::File => Arc::new(FileStorage::new(self.cache_dir()?)),
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        })
    }
}
