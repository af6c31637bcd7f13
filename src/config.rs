use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Channel;
use crate::util::{HOST, PORT, VAR_CONFIG_PATH, VAR_DATA_DIR, VAR_FEEDBACK_INTERVAL_S, VAR_GCM_ENDPOINT, VAR_LOG_CONFIG_PATH};

pub const DEFAULT_GCM_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";
const DEFAULT_FEEDBACK_INTERVAL_S: u64 = 60 * 60;

/// Process level settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub host: String,
    pub port: u16,
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub log_config_path: String,
    pub gcm_endpoint: String,
    pub feedback_interval: Duration,
}

impl EnvConfig {
    pub fn from_env() -> Result<EnvConfig, ConfigError> {
        let port = var_or(PORT, "9898");
        let port = port
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name: PORT, value: port })?;

        let interval = var_or(VAR_FEEDBACK_INTERVAL_S, &DEFAULT_FEEDBACK_INTERVAL_S.to_string());
        let interval: u64 = interval
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name: VAR_FEEDBACK_INTERVAL_S, value: interval })?;

        Ok(EnvConfig {
            host: var_or(HOST, "127.0.0.1"),
            port,
            config_path: PathBuf::from(var_or(VAR_CONFIG_PATH, "config.json")),
            data_dir: PathBuf::from(var_or(VAR_DATA_DIR, ".")),
            log_config_path: var_or(VAR_LOG_CONFIG_PATH, "log4rs.yaml"),
            gcm_endpoint: var_or(VAR_GCM_ENDPOINT, DEFAULT_GCM_ENDPOINT),
            feedback_interval: Duration::from_secs(interval),
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Contents of the application settings file.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Settings {
    pub login: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub apps: Vec<AppSettings>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct AppSettings {
    pub name: String,
    pub gcm_api_key: Option<String>,
    pub apns: Option<ApnsSettings>,
    pub apns_sandbox: Option<ApnsSettings>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

/// Credentials for one APNs environment.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ApnsSettings {
    pub team_id: String,
    pub key_id: String,
    /// `.p8` signing key for provider authentication tokens.
    pub auth_key_path: PathBuf,
    pub topic: String,
    /// Client certificate/key pair for the feedback service. Optional.
    pub feedback_cert: Option<PathBuf>,
    pub feedback_key: Option<PathBuf>,
}

/// A custom broadcast field offered to operators for an app.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub tips: String,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Settings::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Settings, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn app(&self, name: &str) -> Option<&AppSettings> {
        self.apps.iter().find(|app| app.name == name)
    }

    /// Whether the operator endpoints need basic auth at all.
    pub fn requires_auth(&self) -> bool {
        self.login.is_some()
    }
}

impl AppSettings {
    pub fn apns_for(&self, channel: Channel) -> Option<&ApnsSettings> {
        match channel {
            Channel::Apns => self.apns.as_ref(),
            Channel::ApnsSandbox => self.apns_sandbox.as_ref(),
            Channel::Gcm => None,
        }
    }
}
