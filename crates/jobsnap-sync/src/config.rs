use std::path::{Path, PathBuf};

use jobsnap_adapters::{SiteConfig, SiteConfigError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

pub const DEFAULT_CONFIG_PATH: &str = "jobsnap.yaml";
pub const DEFAULT_DATABASE_PATH: &str = "data/jobsnap.sqlite3";

pub const ENV_CONFIG: &str = "JOBSNAP_CONFIG";
pub const ENV_USERNAME: &str = "JOBSNAP_USERNAME";
pub const ENV_PASSWORD: &str = "JOBSNAP_PASSWORD";
pub const ENV_HEADLESS: &str = "JOBSNAP_HEADLESS";
pub const ENV_DATABASE: &str = "JOBSNAP_DATABASE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{name}={value:?} is not a boolean")]
    InvalidEnv { name: &'static str, value: String },
    #[error("schedule.enabled is set but schedule.crons is empty")]
    NoCrons,
    #[error(transparent)]
    Site(#[from] SiteConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// Six-field cron expressions (seconds first), evaluated in UTC.
    pub crons: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            crons: vec!["0 0 6 * * *".to_string(), "0 0 18 * * *".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub site: SiteConfig,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

fn parse_bool(name: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { name, value }),
    }
}

impl AppConfig {
    /// `JOBSNAP_CONFIG` when set, otherwise `jobsnap.yaml` in the working directory.
    pub fn path_from_env() -> PathBuf {
        std::env::var(ENV_CONFIG)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Read, apply environment overrides, and validate.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok()).await
    }

    /// `load`, with overrides looked up through `lookup` instead of the process environment.
    pub async fn load_with<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&text, path)?;
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(username) = lookup(ENV_USERNAME) {
            self.site.credentials.username = username;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.site.credentials.password = password;
        }
        if let Some(headless) = lookup(ENV_HEADLESS) {
            self.site.browser.headless = parse_bool(ENV_HEADLESS, headless)?;
        }
        if let Some(database) = lookup(ENV_DATABASE) {
            self.database_path = PathBuf::from(database);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.site.validate()?;
        if self.schedule.enabled && self.schedule.crons.iter().all(|cron| cron.trim().is_empty()) {
            return Err(ConfigError::NoCrons);
        }
        Ok(())
    }
}
