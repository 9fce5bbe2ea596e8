use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where and how to reach the sync server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// JSON snapshot of the local store. Defaults to the data directory.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default = "default_log_file")]
    pub log_file: String,

    #[serde(default)]
    pub json_format: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(path.as_ref().display().to_string()))?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or start from defaults when it does not exist, then apply
    /// `TETHYS_SYNC_*` environment overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(base_url) = &self.service.base_url {
            let url = url::Url::parse(base_url)
                .map_err(|_| Error::InvalidUrl(base_url.clone()))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::InvalidUrl(base_url.clone()));
            }
        }

        if self.service.timeout_seconds == 0 {
            return Err(Error::Config("Timeout must be greater than 0".to_string()));
        }

        if self.service.page_size == 0 {
            return Err(Error::Config("Page size must be greater than 0".to_string()));
        }

        if self.storage.batch_size == 0 {
            return Err(Error::Config("Batch size must be greater than 0".to_string()));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(base_url) = std::env::var("TETHYS_SYNC_BASE_URL") {
            self.service.base_url = Some(base_url);
        }

        if let Ok(token) = std::env::var("TETHYS_SYNC_AUTH_TOKEN") {
            self.service.auth_token = Some(token);
        }

        if let Ok(level) = std::env::var("TETHYS_SYNC_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(batch_size) = std::env::var("TETHYS_SYNC_BATCH_SIZE") {
            if let Ok(val) = batch_size.parse() {
                self.storage.batch_size = val;
            }
        }
    }

    /// The snapshot location, falling back to the data directory.
    pub fn snapshot_path(&self) -> Result<PathBuf> {
        match &self.storage.snapshot_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("store.json")),
        }
    }

    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("tethys-sync"))
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
    }

    pub fn data_dir() -> Result<PathBuf> {
        dirs::data_dir()
            .map(|dir| dir.join("tethys-sync"))
            .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            auth_token: None,
            timeout_seconds: default_timeout(),
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
            page_size: default_page_size(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            batch_size: default_batch_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_to_file: false,
            log_file: default_log_file(),
            json_format: false,
        }
    }
}

fn default_timeout() -> u64 { 30 }
fn default_user_agent() -> String {
    format!("tethys-sync/{}", env!("CARGO_PKG_VERSION"))
}
fn default_max_redirects() -> usize { 10 }
fn default_page_size() -> usize { 50 }
fn default_batch_size() -> usize { 50 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_file() -> String { "tethys-sync.log".to_string() }
