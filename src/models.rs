use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::Field;
use crate::error::RequestError;
use crate::types::ChannelFlags;

const PARAM_APP: &str = "app";
const PARAM_MESSAGE: &str = "message";
const FLAG_GCM: &str = "GCM";
const FLAG_APNS: &str = "APNS";
const FLAG_APNS_SANDBOX: &str = "APNSSandbox";

/// What every device receives.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub custom_fields: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastRequest {
    pub app: String,
    pub notification: Notification,
    pub channels: ChannelFlags,
}

impl BroadcastRequest {
    /// Validates raw query parameters once, at the edge.
    pub fn from_params(mut params: HashMap<String, String>) -> Result<BroadcastRequest, RequestError> {
        let app = params
            .remove(PARAM_APP)
            .filter(|app| !app.is_empty())
            .ok_or(RequestError::MissingParam(PARAM_APP))?;
        let message = params.remove(PARAM_MESSAGE).unwrap_or_default();

        let mut flag = |name: &str| params.remove(name).map(|v| v == "true").unwrap_or(false);
        let channels = ChannelFlags {
            gcm: flag(FLAG_GCM),
            apns: flag(FLAG_APNS),
            apns_sandbox: flag(FLAG_APNS_SANDBOX),
        };
        if channels.is_empty() {
            return Err(RequestError::NoChannel);
        }

        Ok(BroadcastRequest {
            app,
            notification: Notification {
                message,
                custom_fields: params.into_iter().collect(),
            },
            channels,
        })
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct TokenForm {
    pub app: Option<String>,
    pub token: Option<String>,
}

impl TokenForm {
    /// Both fields, or the error the caller gets back.
    pub fn validate(&self) -> Result<(&str, &str), RequestError> {
        match (self.app.as_deref(), self.token.as_deref()) {
            (Some(app), Some(token)) if !app.is_empty() && !token.is_empty() => Ok((app, token)),
            _ => Err(RequestError::MissingToken),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Serialize, Clone, Debug)]
pub struct StatusResponse {
    pub status: Status,
    pub message: String,
}

impl StatusResponse {
    pub fn success(message: impl Into<String>) -> StatusResponse {
        StatusResponse { status: Status::Success, message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> StatusResponse {
        StatusResponse { status: Status::Error, message: message.into() }
    }
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub name: String,
    pub android_devices: usize,
    pub ios_devices: usize,
    pub ios_sandbox_devices: usize,
    pub fields: Vec<Field>,
}
