use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;

use crate::config::AppSettings;
use crate::error::GatewayError;
use crate::models::Notification;
use crate::types::{Channel, DeliveryOutcome};

/// Retries after the first attempt
pub const SEND_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// A push provider that can deliver one batch of tokens.
#[async_trait]
pub trait PushGateway: Send + Sync {
    fn channel(&self) -> Channel;

    /// Largest number of tokens `send` accepts at once.
    fn max_batch_size(&self) -> usize;

    /// How many batches may be in flight for one broadcast.
    fn max_in_flight(&self) -> usize;

    /// Returns one outcome per token, in batch order.
    async fn send(
        &self,
        app: &AppSettings,
        batch: &[String],
        notification: &Notification,
    ) -> Result<Vec<DeliveryOutcome>, GatewayError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: SEND_RETRIES,
            base_delay: RETRY_BASE_DELAY,
        }
    }
}

/// Runs `op`, retrying transient failures with exponential backoff.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.retries => {
                let delay = policy.base_delay * 2u32.pow(attempt);
                attempt += 1;
                warn!("Provider call failed ({e}), retry {attempt}/{} in {delay:?}", policy.retries);
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}
