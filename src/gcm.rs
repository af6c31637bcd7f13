use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::config::AppSettings;
use crate::error::GatewayError;
use crate::gateway::{with_retries, PushGateway, RetryPolicy};
use crate::models::Notification;
use crate::types::{Channel, DeliveryOutcome};

/// Registration ids accepted by one multicast request.
pub const MAX_GCM_TOKENS: usize = 1000;

/// Errors meaning the registration id will never work again.
const PERMANENT_ERRORS: [&str; 4] = ["NotRegistered", "InvalidRegistration", "MissingRegistration", "MismatchSenderId"];

/// Multicast sender for the GCM-style HTTP API.
pub struct GcmGateway {
    client: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
}

#[derive(Deserialize, Debug)]
pub struct GcmResponse {
    #[serde(default)]
    pub success: u32,
    #[serde(default)]
    pub failure: u32,
    #[serde(default)]
    pub canonical_ids: u32,
    #[serde(default)]
    pub results: Vec<GcmResult>,
}

#[derive(Deserialize, Debug, Default)]
pub struct GcmResult {
    pub message_id: Option<String>,
    pub registration_id: Option<String>,
    pub error: Option<String>,
}

impl GcmGateway {
    pub fn new(client: reqwest::Client, endpoint: String) -> GcmGateway {
        GcmGateway {
            client,
            endpoint,
            retry: RetryPolicy::default(),
        }
    }

    async fn post(&self, api_key: &str, body: &Value) -> Result<GcmResponse, GatewayError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("key={api_key}"))
            .map_err(|_| GatewayError::MalformedResponse("api key is not a valid header".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let res = self.client.post(&self.endpoint).headers(headers).json(body).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(GatewayError::Status { status: status.as_u16(), body });
        }
        Ok(res.json().await?)
    }
}

#[async_trait]
impl PushGateway for GcmGateway {
    fn channel(&self) -> Channel {
        Channel::Gcm
    }

    fn max_batch_size(&self) -> usize {
        MAX_GCM_TOKENS
    }

    fn max_in_flight(&self) -> usize {
        // One request per batch, all at once
        usize::MAX
    }

    async fn send(
        &self,
        app: &AppSettings,
        batch: &[String],
        notification: &Notification,
    ) -> Result<Vec<DeliveryOutcome>, GatewayError> {
        let api_key = app.gcm_api_key.as_deref().ok_or_else(|| GatewayError::MissingCredentials {
            app: app.name.clone(),
            channel: Channel::Gcm,
        })?;
        let body = get_gcm_body(batch, notification);

        let response = with_retries(self.retry, || self.post(api_key, &body)).await?;
        let accepted = response.results.iter().filter(|result| result.message_id.is_some()).count();
        debug!(
            "GCM response: success={}, failure={}, canonical_ids={}, message ids={}",
            response.success, response.failure, response.canonical_ids, accepted
        );
        classify_results(batch, &response)
    }
}

fn get_gcm_body(batch: &[String], notification: &Notification) -> Value {
    let mut data = Map::new();
    for (key, value) in &notification.custom_fields {
        data.insert(key.clone(), Value::String(value.clone()));
    }
    data.insert("message".into(), Value::String(notification.message.clone()));

    json!({
        "registration_ids": batch,
        "data": data,
    })
}

/// Pairs each token with the result the provider returned at its index.
pub fn classify_results(batch: &[String], response: &GcmResponse) -> Result<Vec<DeliveryOutcome>, GatewayError> {
    if response.results.len() != batch.len() {
        return Err(GatewayError::MalformedResponse(format!(
            "{} results for {} tokens",
            response.results.len(),
            batch.len()
        )));
    }

    Ok(batch
        .iter()
        .zip(&response.results)
        .map(|(token, result)| classify(token, result))
        .collect())
}

fn classify(token: &str, result: &GcmResult) -> DeliveryOutcome {
    match (&result.registration_id, &result.error) {
        (_, Some(error)) if PERMANENT_ERRORS.contains(&error.as_str()) => DeliveryOutcome::Invalid,
        (_, Some(error)) => DeliveryOutcome::Failed(error.clone()),
        (Some(canonical), None) if canonical != token => DeliveryOutcome::Rotated(canonical.clone()),
        _ => DeliveryOutcome::Delivered,
    }
}
