use std::path::PathBuf;

use thiserror::Error;

use crate::authtoken::AuthTokenError;
use crate::types::Channel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidVar { name: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("token file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("token file encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("no {channel} credentials configured for {app}")]
    MissingCredentials { app: String, channel: Channel },
    #[error("auth token: {0}")]
    Auth(#[from] AuthTokenError),
}

impl GatewayError {
    /// Worth another attempt: network trouble or a provider-side error.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("feedback I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("feedback TLS: {0}")]
    Tls(String),
    #[error("feedback task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<openssl::error::ErrorStack> for FeedbackError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        FeedbackError::Tls(e.to_string())
    }
}

/// Bad input on the synchronous HTTP path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("app and token params are required")]
    MissingToken,
    #[error("{0} param is required")]
    MissingParam(&'static str),
    #[error("at least one of GCM, APNS, APNSSandbox must be true")]
    NoChannel,
}
