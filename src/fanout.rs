use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use crate::config::{AppSettings, Settings};
use crate::gateway::PushGateway;
use crate::models::{BroadcastRequest, Notification};
use crate::store::{Registry, TokenStore};
use crate::types::{Channel, DeliveryOutcome};
use crate::util::get_short_token;
use crate::weblogs::LogSink;

/// What one channel's fanout did, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub channel: Channel,
    pub devices: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub elapsed: Duration,
}

/// Delivers broadcasts to every registered device of an app.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Registry,
    settings: Arc<Settings>,
    sink: LogSink,
    gateways: HashMap<Channel, Arc<dyn PushGateway>>,
    /// <(channel, app), feedback supervisor waker>
    feedback: HashMap<(Channel, String), Arc<Notify>>,
}

impl Broadcaster {
    pub fn new(registry: Registry, settings: Arc<Settings>, sink: LogSink) -> Broadcaster {
        Broadcaster {
            registry,
            settings,
            sink,
            gateways: HashMap::new(),
            feedback: HashMap::new(),
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PushGateway>) -> Broadcaster {
        self.gateways.insert(gateway.channel(), gateway);
        self
    }

    /// Feedback for `channel`/`app` is checked again after each broadcast there.
    pub fn with_feedback_waker(mut self, channel: Channel, app: &str, waker: Arc<Notify>) -> Broadcaster {
        self.feedback.insert((channel, app.to_string()), waker);
        self
    }

    /// Starts one fanout per requested channel and returns right away.
    pub fn trigger(&self, request: BroadcastRequest) {
        let notification = Arc::new(request.notification);
        for channel in request.channels.channels() {
            let broadcaster = self.clone();
            let app = request.app.clone();
            let notification = Arc::clone(&notification);
            tokio::spawn(async move {
                broadcaster.fanout(channel, &app, notification).await;
            });
        }
    }

    /// Sends `notification` to every `app` token on `channel` and waits for
    /// all batches. `None` when nothing could be attempted.
    pub async fn fanout(&self, channel: Channel, app: &str, notification: Arc<Notification>) -> Option<FanoutReport> {
        let Some(app_settings) = self.settings.app(app) else {
            warn!("No app with the name: {}", app);
            self.sink.emit(channel, format!("Broadcast abandoned: no app with the name {app}"));
            return None;
        };
        let Some(gateway) = self.gateways.get(&channel) else {
            warn!("No {} gateway configured, skipping broadcast for {}", channel, app);
            return None;
        };

        let started = Instant::now();
        let store = self.registry.store(channel).clone();
        let tokens = self.registry.list_tokens(channel, app).await;
        let batches: Vec<Vec<String>> = tokens
            .chunks(gateway.max_batch_size().max(1))
            .map(<[String]>::to_vec)
            .collect();
        let batch_count = batches.len();
        let permits = gateway.max_in_flight().min(batch_count).max(1);
        let in_flight = Arc::new(Semaphore::new(permits));
        let app_settings = Arc::new(app_settings.clone());

        let mut sends = JoinSet::new();
        for (index, batch) in batches.into_iter().enumerate() {
            let req_number = index + 1;
            if gateway.max_batch_size() > 1 {
                debug!("Send request {} to the {} server", req_number, channel);
            }
            let job = BatchJob {
                req_number,
                batch,
                app: Arc::clone(&app_settings),
                notification: Arc::clone(&notification),
                gateway: Arc::clone(gateway),
                store: store.clone(),
                sink: self.sink.clone(),
            };
            let in_flight = Arc::clone(&in_flight);
            sends.spawn(async move {
                // The semaphore is never closed
                let _permit = in_flight.acquire_owned().await.ok();
                job.run().await
            });
        }

        let mut failed_batches = 0;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok(true) => {}
                Ok(false) => failed_batches += 1,
                Err(e) => {
                    error!("{} send task for {} died: {}", channel, app, e);
                    failed_batches += 1;
                }
            }
        }

        let report = FanoutReport {
            channel,
            devices: tokens.len(),
            batches: batch_count,
            failed_batches,
            elapsed: started.elapsed(),
        };
        self.sink.emit(
            channel,
            format!(
                "Notifications sent to {} {} devices in {:?} ({} of {} requests failed)",
                report.devices, channel, report.elapsed, report.failed_batches, report.batches
            ),
        );

        if channel.is_apns() {
            if let Some(waker) = self.feedback.get(&(channel, app.to_string())) {
                waker.notify_one();
            }
        }
        Some(report)
    }
}

/// One provider request and the store updates its answer calls for.
struct BatchJob {
    req_number: usize,
    batch: Vec<String>,
    app: Arc<AppSettings>,
    notification: Arc<Notification>,
    gateway: Arc<dyn PushGateway>,
    store: TokenStore,
    sink: LogSink,
}

impl BatchJob {
    /// True when the provider answered.
    async fn run(self) -> bool {
        let channel = self.gateway.channel();
        let started = Instant::now();

        match self.gateway.send(&self.app, &self.batch, &self.notification).await {
            Ok(outcomes) => {
                apply_outcomes(&self.store, &self.app.name, &self.batch, outcomes).await;
                if self.batch.len() > 1 {
                    self.sink.emit(
                        channel,
                        format!(
                            "Request {} sent to {} devices in {:?}",
                            self.req_number,
                            self.batch.len(),
                            started.elapsed()
                        ),
                    );
                }
                true
            }
            Err(e) => {
                error!("{} request {} for {} failed: {}", channel, self.req_number, self.app.name, e);
                self.sink.emit(channel, format!("ERROR: request {} failed: {e}", self.req_number));
                false
            }
        }
    }
}

/// Feeds provider verdicts back into the store.
pub async fn apply_outcomes(store: &TokenStore, app: &str, batch: &[String], outcomes: Vec<DeliveryOutcome>) {
    if outcomes.len() != batch.len() {
        warn!("{} outcomes for {} tokens, ignoring the extras", outcomes.len(), batch.len());
    }

    for (token, outcome) in batch.iter().zip(outcomes) {
        match outcome {
            DeliveryOutcome::Delivered => {}
            DeliveryOutcome::Invalid => store.remove(app, token).await,
            DeliveryOutcome::Rotated(canonical) => {
                // Remove first so the old and new token never coexist for long
                store.remove(app, token).await;
                store.add(app, &canonical).await;
            }
            DeliveryOutcome::Failed(reason) => {
                debug!("{} delivery to ...{} failed: {}", store.channel(), get_short_token(token), reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::types::ChannelFlags;
    use crate::weblogs::LogStream;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Verdict = fn(&str) -> DeliveryOutcome;

    /// Records each batch and answers per token with `verdict`.
    struct FakeGateway {
        channel: Channel,
        max_batch_size: usize,
        verdict: Verdict,
        fail_batches: bool,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeGateway {
        fn new(channel: Channel, max_batch_size: usize, verdict: Verdict) -> Arc<FakeGateway> {
            Arc::new(FakeGateway {
                channel,
                max_batch_size,
                verdict,
                fail_batches: false,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing(channel: Channel) -> Arc<FakeGateway> {
            Arc::new(FakeGateway {
                channel,
                max_batch_size: 1000,
                verdict: |_| DeliveryOutcome::Delivered,
                fail_batches: true,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn batch_sizes(&self) -> Vec<usize> {
            let mut sizes: Vec<usize> = self.calls.lock().unwrap().iter().map(Vec::len).collect();
            sizes.sort_unstable_by(|a, b| b.cmp(a));
            sizes
        }
    }

    #[async_trait]
    impl PushGateway for FakeGateway {
        fn channel(&self) -> Channel {
            self.channel
        }

        fn max_batch_size(&self) -> usize {
            self.max_batch_size
        }

        fn max_in_flight(&self) -> usize {
            4
        }

        async fn send(
            &self,
            _app: &AppSettings,
            batch: &[String],
            _notification: &Notification,
        ) -> Result<Vec<DeliveryOutcome>, GatewayError> {
            self.calls.lock().unwrap().push(batch.to_vec());
            if self.fail_batches {
                return Err(GatewayError::Status { status: 503, body: "Unavailable".into() });
            }
            Ok(batch.iter().map(|token| (self.verdict)(token)).collect())
        }
    }

    fn settings() -> Arc<Settings> {
        Arc::new(Settings {
            apps: vec![AppSettings { name: "App1".into(), ..Default::default() }],
            ..Default::default()
        })
    }

    async fn registry_with(channel: Channel, count: usize) -> Registry {
        let registry = Registry::in_memory();
        for n in 0..count {
            registry.add_token(channel, "App1", &format!("token-{n}")).await;
        }
        registry
    }

    fn notification() -> Arc<Notification> {
        Arc::new(Notification { message: "hello".into(), ..Default::default() })
    }

    #[tokio::test]
    async fn splits_into_bounded_batches() {
        let registry = registry_with(Channel::Gcm, 2500).await;
        let gateway = FakeGateway::new(Channel::Gcm, 1000, |_| DeliveryOutcome::Delivered);
        let broadcaster = Broadcaster::new(registry.clone(), settings(), LogSink::new()).with_gateway(gateway.clone());

        let report = broadcaster.fanout(Channel::Gcm, "App1", notification()).await.unwrap();

        assert_eq!(gateway.batch_sizes(), vec![1000, 1000, 500]);
        assert_eq!(report.devices, 2500);
        assert_eq!(report.batches, 3);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(registry.count_tokens(Channel::Gcm, "App1").await, 2500);
    }

    #[tokio::test]
    async fn every_token_is_sent_exactly_once() {
        let registry = registry_with(Channel::Apns, 100).await;
        let gateway = FakeGateway::new(Channel::Apns, 1, |_| DeliveryOutcome::Delivered);
        let broadcaster = Broadcaster::new(registry.clone(), settings(), LogSink::new()).with_gateway(gateway.clone());

        broadcaster.fanout(Channel::Apns, "App1", notification()).await.unwrap();

        let mut sent: Vec<String> = gateway.calls.lock().unwrap().concat();
        sent.sort();
        let mut expected = registry.list_tokens(Channel::Apns, "App1").await;
        expected.sort();
        assert_eq!(sent, expected);
    }

    #[tokio::test]
    async fn invalid_tokens_are_removed() {
        let registry = registry_with(Channel::ApnsSandbox, 4).await;
        let gateway = FakeGateway::new(Channel::ApnsSandbox, 1, |token| {
            if token == "token-1" || token == "token-3" {
                DeliveryOutcome::Invalid
            } else {
                DeliveryOutcome::Delivered
            }
        });
        let broadcaster = Broadcaster::new(registry.clone(), settings(), LogSink::new()).with_gateway(gateway);

        broadcaster.fanout(Channel::ApnsSandbox, "App1", notification()).await.unwrap();

        assert_eq!(registry.list_tokens(Channel::ApnsSandbox, "App1").await, vec!["token-0", "token-2"]);
    }

    #[tokio::test]
    async fn rotated_tokens_are_replaced() {
        let registry = Registry::in_memory();
        registry.add_token(Channel::Gcm, "App1", "A").await;
        registry.add_token(Channel::Gcm, "App1", "C").await;
        let gateway = FakeGateway::new(Channel::Gcm, 1000, |token| match token {
            "A" => DeliveryOutcome::Rotated("B".into()),
            _ => DeliveryOutcome::Delivered,
        });
        let broadcaster = Broadcaster::new(registry.clone(), settings(), LogSink::new()).with_gateway(gateway);

        broadcaster.fanout(Channel::Gcm, "App1", notification()).await.unwrap();

        let tokens = registry.list_tokens(Channel::Gcm, "App1").await;
        assert!(!tokens.contains(&"A".to_string()));
        assert!(tokens.contains(&"B".to_string()));
        assert!(tokens.contains(&"C".to_string()));
    }

    #[tokio::test]
    async fn rotation_onto_a_known_token_keeps_one_copy() {
        let store = TokenStore::new(Channel::Gcm);
        store.add("App1", "A").await;
        store.add("App1", "B").await;

        let batch = vec!["A".to_string()];
        apply_outcomes(&store, "App1", &batch, vec![DeliveryOutcome::Rotated("B".into())]).await;

        assert_eq!(store.list("App1").await, vec!["B"]);
    }

    #[tokio::test]
    async fn transient_failures_keep_tokens() {
        let registry = registry_with(Channel::Gcm, 3).await;
        let gateway = FakeGateway::new(Channel::Gcm, 1000, |_| DeliveryOutcome::Failed("Unavailable".into()));
        let broadcaster = Broadcaster::new(registry.clone(), settings(), LogSink::new()).with_gateway(gateway);

        broadcaster.fanout(Channel::Gcm, "App1", notification()).await.unwrap();
        assert_eq!(registry.count_tokens(Channel::Gcm, "App1").await, 3);
    }

    #[tokio::test]
    async fn failed_batches_are_counted_not_fatal() {
        let registry = registry_with(Channel::Gcm, 1500).await;
        let gateway = FakeGateway::failing(Channel::Gcm);
        let broadcaster = Broadcaster::new(registry.clone(), settings(), LogSink::new()).with_gateway(gateway);

        let report = broadcaster.fanout(Channel::Gcm, "App1", notification()).await.unwrap();

        assert_eq!(report.batches, 2);
        assert_eq!(report.failed_batches, 2);
        assert_eq!(registry.count_tokens(Channel::Gcm, "App1").await, 1500);
    }

    #[tokio::test]
    async fn unknown_app_contacts_nobody() {
        let registry = Registry::in_memory();
        registry.add_token(Channel::Gcm, "NoSuchApp", "t").await;
        let gateway = FakeGateway::new(Channel::Gcm, 1000, |_| DeliveryOutcome::Invalid);
        let broadcaster = Broadcaster::new(registry.clone(), settings(), LogSink::new()).with_gateway(gateway.clone());

        assert!(broadcaster.fanout(Channel::Gcm, "NoSuchApp", notification()).await.is_none());
        assert!(gateway.calls.lock().unwrap().is_empty());
        assert_eq!(registry.list_tokens(Channel::Gcm, "NoSuchApp").await, vec!["t"]);
    }

    #[tokio::test]
    async fn empty_app_sends_nothing() {
        let gateway = FakeGateway::new(Channel::Gcm, 1000, |_| DeliveryOutcome::Delivered);
        let broadcaster = Broadcaster::new(Registry::in_memory(), settings(), LogSink::new()).with_gateway(gateway.clone());

        let report = broadcaster.fanout(Channel::Gcm, "App1", notification()).await.unwrap();
        assert_eq!(report.batches, 0);
        assert!(gateway.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_goes_to_the_log_sink() {
        let registry = registry_with(Channel::Gcm, 1200).await;
        let gateway = FakeGateway::new(Channel::Gcm, 1000, |_| DeliveryOutcome::Delivered);
        let sink = LogSink::new();
        let mut lines = sink.subscribe(LogStream::Gcm);
        let broadcaster = Broadcaster::new(registry, settings(), sink).with_gateway(gateway);

        broadcaster.fanout(Channel::Gcm, "App1", notification()).await.unwrap();

        let mut summary = None;
        while let Ok(line) = lines.try_recv() {
            if line.starts_with("Notifications sent to") {
                summary = Some(line);
            }
        }
        let summary = summary.unwrap();
        assert!(summary.starts_with("Notifications sent to 1200 GCM devices in "), "{summary}");
        assert!(summary.ends_with("(0 of 2 requests failed)"), "{summary}");
    }

    #[tokio::test]
    async fn apns_fanout_wakes_feedback() {
        let registry = registry_with(Channel::Apns, 1).await;
        let gateway = FakeGateway::new(Channel::Apns, 1, |_| DeliveryOutcome::Delivered);
        let waker = Arc::new(Notify::new());
        let broadcaster = Broadcaster::new(registry, settings(), LogSink::new())
            .with_gateway(gateway)
            .with_feedback_waker(Channel::Apns, "App1", Arc::clone(&waker));

        broadcaster.fanout(Channel::Apns, "App1", notification()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waker.notified()).await.unwrap();
    }

    #[tokio::test]
    async fn trigger_returns_before_delivery() {
        let registry = registry_with(Channel::Gcm, 10).await;
        let gcm = FakeGateway::new(Channel::Gcm, 1000, |_| DeliveryOutcome::Invalid);
        let apns = FakeGateway::new(Channel::Apns, 1, |_| DeliveryOutcome::Delivered);
        let broadcaster = Broadcaster::new(registry.clone(), settings(), LogSink::new())
            .with_gateway(gcm.clone())
            .with_gateway(apns.clone());

        broadcaster.trigger(BroadcastRequest {
            app: "App1".into(),
            notification: Notification::default(),
            channels: ChannelFlags { gcm: true, ..Default::default() },
        });

        for _ in 0..200 {
            if registry.count_tokens(Channel::Gcm, "App1").await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.count_tokens(Channel::Gcm, "App1").await, 0);
        assert!(apns.calls.lock().unwrap().is_empty());
    }
}
