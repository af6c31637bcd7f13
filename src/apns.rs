use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, error};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

use crate::authtoken::AuthToken;
use crate::config::{AppSettings, ApnsSettings};
use crate::error::GatewayError;
use crate::gateway::{with_retries, PushGateway, RetryPolicy};
use crate::models::Notification;
use crate::types::{Channel, DeliveryOutcome};
use crate::util::get_short_token;

pub const APNS_HOST_NAME: &str = "api.push.apple.com";
pub const APNS_SANDBOX_HOST_NAME: &str = "api.sandbox.push.apple.com";

/// Notifications in flight per APNs broadcast.
const MAX_IN_FLIGHT: usize = 32;

/// Rejection reasons that mean the device token itself is dead.
const INVALID_TOKEN_REASONS: [&str; 3] = ["BadDeviceToken", "DeviceTokenNotForTopic", "Unregistered"];

/// Sends one notification per device over HTTP/2.
pub struct ApnsGateway {
    channel: Channel,
    client: reqwest::Client,
    host: String,
    retry: RetryPolicy,
    /// <app, AuthToken>
    auth_tokens: RwLock<HashMap<String, AuthToken>>,
}

#[derive(Deserialize, Debug, Default)]
struct ApnsErrorBody {
    #[serde(default)]
    reason: String,
}

impl ApnsGateway {
    pub fn new(channel: Channel) -> Result<ApnsGateway, GatewayError> {
        let host = match channel {
            Channel::ApnsSandbox => APNS_SANDBOX_HOST_NAME,
            _ => APNS_HOST_NAME,
        };
        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .build()?;
        Ok(ApnsGateway {
            channel,
            client,
            host: host.to_string(),
            retry: RetryPolicy::default(),
            auth_tokens: RwLock::new(HashMap::new()),
        })
    }

    fn credentials<'a>(&self, app: &'a AppSettings) -> Result<&'a ApnsSettings, GatewayError> {
        app.apns_for(self.channel).ok_or_else(|| GatewayError::MissingCredentials {
            app: app.name.clone(),
            channel: self.channel,
        })
    }

    /// Current provider token for `app`, signing a new one when stale.
    async fn auth_token(&self, app: &str, settings: &ApnsSettings) -> Result<String, GatewayError> {
        if let Some(auth) = self.auth_tokens.read().await.get(app) {
            if !auth.is_stale() {
                return Ok(auth.token.clone());
            }
        }

        let mut auth_tokens = self.auth_tokens.write().await;
        match auth_tokens.get_mut(app) {
            Some(auth) => {
                if auth.is_stale() {
                    auth.refresh()?;
                    debug!("apns:: refreshed auth token for {}", app);
                }
                Ok(auth.token.clone())
            }
            None => {
                let auth = AuthToken::new(settings)?;
                let token = auth.token.clone();
                auth_tokens.insert(app.to_string(), auth);
                Ok(token)
            }
        }
    }

    async fn post(&self, device_token: &str, auth_token: &str, topic: &str, body: &str) -> Result<DeliveryOutcome, GatewayError> {
        let url = format!("https://{}/3/device/{}", self.host, device_token);

        let mut headers = HeaderMap::new();
        let topic = HeaderValue::from_str(topic)
            .map_err(|_| GatewayError::MalformedResponse(format!("topic {topic:?} is not a valid header")))?;
        let authorization = HeaderValue::from_str(&format!("bearer {}", auth_token))
            .map_err(|_| GatewayError::MalformedResponse("auth token is not a valid header".into()))?;
        headers.insert("apns-topic", topic);
        headers.insert("apns-push-type", HeaderValue::from_static("alert"));
        headers.insert("apns-priority", HeaderValue::from_static("10"));
        headers.insert("authorization", authorization);
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let res = self.client.post(url)
            .headers(headers)
            .body(body.to_string())
            .send()
            .await?;

        let status = res.status();
        let blank_header = HeaderValue::from_static("");
        let apns_id = res.headers().get("apns-id").unwrap_or(&blank_header).to_str().unwrap_or_default().to_string();
        let text = res.text().await.unwrap_or_default();
        debug!("APNs response: status={}, apns-id={}, device=...{}, {}", status, apns_id, get_short_token(device_token), text);

        classify_response(status, &text)
    }
}

#[async_trait]
impl PushGateway for ApnsGateway {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn max_batch_size(&self) -> usize {
        1
    }

    fn max_in_flight(&self) -> usize {
        MAX_IN_FLIGHT
    }

    async fn send(
        &self,
        app: &AppSettings,
        batch: &[String],
        notification: &Notification,
    ) -> Result<Vec<DeliveryOutcome>, GatewayError> {
        let settings = self.credentials(app)?;
        let auth_token = self.auth_token(&app.name, settings).await?;
        let body = get_apns_body(notification);

        let mut outcomes = Vec::with_capacity(batch.len());
        for device_token in batch {
            let result = with_retries(self.retry, || self.post(device_token, &auth_token, &settings.topic, &body)).await;
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("APNs error for ...{}: {e}", get_short_token(device_token));
                    DeliveryOutcome::Failed(e.to_string())
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

fn get_apns_body(notification: &Notification) -> String {
    let mut body = Map::new();
    for (key, value) in &notification.custom_fields {
        body.insert(key.clone(), Value::String(value.clone()));
    }
    body.insert("aps".into(), json!({
        "alert": notification.message,
        "sound": "default",
    }));
    Value::Object(body).to_string()
}

/// Maps an APNs answer for one device to an outcome. Server errors are
/// returned as errors so the caller can retry them.
fn classify_response(status: StatusCode, body: &str) -> Result<DeliveryOutcome, GatewayError> {
    if status.is_success() {
        return Ok(DeliveryOutcome::Delivered);
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(GatewayError::Status { status: status.as_u16(), body: body.to_string() });
    }

    let reason = serde_json::from_str::<ApnsErrorBody>(body).unwrap_or_default().reason;
    if status == StatusCode::GONE || INVALID_TOKEN_REASONS.contains(&reason.as_str()) {
        Ok(DeliveryOutcome::Invalid)
    } else {
        Ok(DeliveryOutcome::Failed(format!("{} {}", status.as_u16(), reason)))
    }
}
