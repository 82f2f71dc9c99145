pub mod error;

pub use error::*;

use gsm_cloud::{PollConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STATE_DIR_ENV: &str = "GSM_STATE_DIR";
pub const REGION_ENV: &str = "GSM_REGION";
pub const CATALOG_PATH_ENV: &str = "GSM_CATALOG_PATH";

const DEFAULT_STATE_DIR: &str = ".gsm";
const SETTINGS_FILE: &str = "settings.json";
const CATALOG_FILE: &str = "catalog.json";
const KEYS_DIR: &str = "keys";

/// Get the gsm state directory, creating it if needed
///
/// Lookup order:
/// 1. `GSM_STATE_DIR` environment variable
/// 2. `~/.gsm`
pub fn state_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(STATE_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .ok_or(ConfigError::HomeDirNotFound)?
            .join(DEFAULT_STATE_DIR),
    };

    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        tracing::debug!("Created state directory: {}", dir.display());
    }

    Ok(dir)
}

/// Retry settings as stored in `settings.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Polling settings for instance boot, volume and snapshot completion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollSettings {
    pub interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            timeout_secs: 900,
        }
    }
}

/// gsm settings
///
/// Loaded from `<state_dir>/settings.json` when present; every field is
/// optional. Environment variables override the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Not read from the file; always the directory the file was found in
    #[serde(skip)]
    pub state_dir: PathBuf,

    pub region: String,
    pub catalog_path: Option<PathBuf>,
    pub key_dir: Option<PathBuf>,
    pub key_name: String,
    pub ssh_user: String,

    /// Source range allowed to reach SSH on provisioned instances
    pub ssh_cidr: String,
    pub retry: RetrySettings,
    pub poll: PollSettings,
    pub lock_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            region: "us-east-1".to_string(),
            catalog_path: None,
            key_dir: None,
            key_name: "gsm-key".to_string(),
            ssh_user: "ec2-user".to_string(),
            ssh_cidr: "0.0.0.0/0".to_string(),
            retry: RetrySettings::default(),
            poll: PollSettings::default(),
            lock_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Load settings from the default state directory
    pub fn load() -> Result<Self> {
        let dir = state_dir()?;
        Self::load_from(&dir)
    }

    /// Load settings from a specific state directory
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(SETTINGS_FILE);
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|source| ConfigError::InvalidSettings {
                path: path.clone(),
                source,
            })?
        } else {
            Settings::default()
        };
        settings.state_dir = dir.to_path_buf();

        if let Ok(region) = std::env::var(REGION_ENV) {
            if !region.is_empty() {
                settings.region = region;
            }
        }
        if let Some(catalog) = std::env::var_os(CATALOG_PATH_ENV) {
            if !catalog.is_empty() {
                settings.catalog_path = Some(PathBuf::from(catalog));
            }
        }

        tracing::debug!(
            state_dir = %settings.state_dir.display(),
            region = %settings.region,
            "Settings loaded"
        );
        Ok(settings)
    }

    /// Directory holding private keys for the remote-command channel
    pub fn key_dir(&self) -> PathBuf {
        self.key_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join(KEYS_DIR))
    }

    /// Catalog document to load, or `None` for the built-in catalog
    ///
    /// An explicitly configured path must exist; the default
    /// `<state_dir>/catalog.json` is optional.
    pub fn catalog_file(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.catalog_path {
            if !path.exists() {
                return Err(ConfigError::CatalogNotFound(path.clone()));
            }
            return Ok(Some(path.clone()));
        }

        let default = self.state_dir.join(CATALOG_FILE);
        Ok(default.exists().then_some(default))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.multiplier,
        }
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.poll.interval_ms),
            timeout: Duration::from_secs(self.poll.timeout_secs),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}
