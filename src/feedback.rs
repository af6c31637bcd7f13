//! Reconciles token stores against the providers' invalid-token feedback.
//!
//! A [`Reconciler`] makes one pass: connect to a [`FeedbackSource`], remove
//! every token it reports, stop when the stream ends. The [`Supervisor`]
//! owns the restart policy around it.

use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslStream};
use tokio::sync::{mpsc, watch, Notify};

use crate::config::ApnsSettings;
use crate::error::FeedbackError;
use crate::store::TokenStore;
use crate::types::Channel;
use crate::util::get_short_token;
use crate::weblogs::LogSink;

pub const APNS_FEEDBACK_HOST_NAME: &str = "feedback.push.apple.com";
pub const APNS_FEEDBACK_SANDBOX_HOST_NAME: &str = "feedback.sandbox.push.apple.com";
const APNS_FEEDBACK_PORT: u16 = 2196;

/// The service sends everything it has right away, then goes quiet.
const FEEDBACK_TIMEOUT: Duration = Duration::from_secs(5);
const FEEDBACK_QUEUE_SIZE: usize = 64;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// A device token the provider no longer accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackEvent {
    /// Seconds since epoch when the provider noticed.
    pub timestamp: u32,
    pub device_token: String,
}

#[async_trait]
pub trait FeedbackSource: Send + Sync {
    /// Opens the stream. It ends when the provider has nothing more to say.
    async fn connect(&self) -> Result<mpsc::Receiver<FeedbackEvent>, FeedbackError>;
}

/// The legacy APNs feedback service, spoken over TLS with a client certificate.
#[derive(Debug, Clone)]
pub struct ApnsFeedback {
    host: String,
    port: u16,
    cert: PathBuf,
    key: PathBuf,
}

impl ApnsFeedback {
    /// `None` unless the app configured a feedback certificate and key.
    pub fn new(channel: Channel, settings: &ApnsSettings) -> Option<ApnsFeedback> {
        let host = match channel {
            Channel::Apns => APNS_FEEDBACK_HOST_NAME,
            Channel::ApnsSandbox => APNS_FEEDBACK_SANDBOX_HOST_NAME,
            Channel::Gcm => return None,
        };
        Some(ApnsFeedback {
            host: host.to_string(),
            port: APNS_FEEDBACK_PORT,
            cert: settings.feedback_cert.clone()?,
            key: settings.feedback_key.clone()?,
        })
    }

    fn open_stream(&self) -> Result<SslStream<TcpStream>, FeedbackError> {
        let mut builder = SslConnector::builder(SslMethod::tls())?;
        builder.set_certificate_file(&self.cert, SslFiletype::PEM)?;
        builder.set_private_key_file(&self.key, SslFiletype::PEM)?;
        let connector = builder.build();

        let tcp = TcpStream::connect((self.host.as_str(), self.port))?;
        tcp.set_read_timeout(Some(FEEDBACK_TIMEOUT))?;
        connector
            .connect(&self.host, tcp)
            .map_err(|e| FeedbackError::Tls(e.to_string()))
    }
}

#[async_trait]
impl FeedbackSource for ApnsFeedback {
    async fn connect(&self) -> Result<mpsc::Receiver<FeedbackEvent>, FeedbackError> {
        debug!(
            "- connecting to {} to check for deactivated tokens (maximum read timeout = {:?})",
            self.host, FEEDBACK_TIMEOUT
        );
        let source = self.clone();
        let stream = tokio::task::spawn_blocking(move || source.open_stream()).await??;

        let (tx, rx) = mpsc::channel(FEEDBACK_QUEUE_SIZE);
        tokio::task::spawn_blocking(move || read_events(stream, tx));
        Ok(rx)
    }
}

/// Forwards tuples from `reader` until EOF, timeout or a dropped receiver.
fn read_events<R: Read>(mut reader: R, tx: mpsc::Sender<FeedbackEvent>) {
    loop {
        match read_tuple(&mut reader) {
            Ok(Some(event)) => {
                if tx.blocking_send(event).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                debug!("- nothing more returned from the feedback service");
                return;
            }
            Err(e) => {
                warn!("Feedback stream broke off: {}", e);
                return;
            }
        }
    }
}

/// Reads one `[u32 BE timestamp][u16 BE length][token]` tuple. `None` at EOF.
pub fn read_tuple<R: Read>(reader: &mut R) -> std::io::Result<Option<FeedbackEvent>> {
    let mut header = [0u8; 6];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let timestamp = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut token = vec![0u8; len];
    reader.read_exact(&mut token)?;

    Ok(Some(FeedbackEvent {
        timestamp,
        device_token: hex::encode(&token),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Connecting,
    Listening,
    Shutdown,
}

/// Applies one app's feedback on one channel to that channel's store.
pub struct Reconciler {
    channel: Channel,
    app: String,
    store: TokenStore,
    source: Arc<dyn FeedbackSource>,
    sink: LogSink,
    state: ReconcilerState,
}

impl Reconciler {
    pub fn new(app: String, store: TokenStore, source: Arc<dyn FeedbackSource>, sink: LogSink) -> Reconciler {
        Reconciler {
            channel: store.channel(),
            app,
            store,
            source,
            sink,
            state: ReconcilerState::Shutdown,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    /// One connecting -> listening -> shutdown pass. Returns how many
    /// tokens the provider reported.
    pub async fn run_once(&mut self) -> Result<usize, FeedbackError> {
        self.transition(ReconcilerState::Connecting);
        let mut events = match self.source.connect().await {
            Ok(events) => events,
            Err(e) => {
                self.transition(ReconcilerState::Shutdown);
                return Err(e);
            }
        };

        self.transition(ReconcilerState::Listening);
        let mut reported = 0;
        while let Some(event) = events.recv().await {
            debug!("- recv'd: ...{} (since {})", get_short_token(&event.device_token), event.timestamp);
            self.store.remove(&self.app, &event.device_token).await;
            reported += 1;
        }
        self.transition(ReconcilerState::Shutdown);

        if reported > 0 {
            self.sink.emit(
                self.channel,
                format!("Feedback removed {} deactivated tokens for {}", reported, self.app),
            );
        }
        Ok(reported)
    }

    fn transition(&mut self, state: ReconcilerState) {
        debug!("feedback:: {} {} {:?} -> {:?}", self.channel, self.app, self.state, state);
        self.state = state;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Pause after a clean pass.
    pub interval: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl RestartPolicy {
    pub fn new(interval: Duration) -> RestartPolicy {
        RestartPolicy {
            interval,
            min_backoff: MIN_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

/// Keeps a reconciler running: restarts it after each pass, backs off on
/// failures and stops once `shutdown` turns true.
pub struct Supervisor {
    reconciler: Reconciler,
    policy: RestartPolicy,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(reconciler: Reconciler, policy: RestartPolicy, shutdown: watch::Receiver<bool>) -> Supervisor {
        Supervisor {
            reconciler,
            policy,
            wake: Arc::new(Notify::new()),
            shutdown,
        }
    }

    /// Notifying it cuts the current pause short.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Returns the number of passes made.
    pub async fn run(mut self) -> usize {
        let channel = self.reconciler.channel;
        let app = self.reconciler.app.clone();
        let mut backoff = self.policy.min_backoff;
        let mut passes = 0;
        info!("Feedback supervisor started for {} {}", channel, app);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let result = tokio::select! {
                result = self.reconciler.run_once() => result,
                _ = self.shutdown.changed() => break,
            };
            passes += 1;

            let pause = match result {
                Ok(_) => {
                    backoff = self.policy.min_backoff;
                    self.policy.interval
                }
                Err(e) => {
                    warn!("Feedback for {} {} failed: {}, retrying in {:?}", channel, app, e, backoff);
                    let pause = backoff;
                    backoff = (backoff * 2).min(self.policy.max_backoff);
                    pause
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.wake.notified() => debug!("feedback:: {} {} woken up", channel, app),
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            "Feedback supervisor stopped for {} {} after {} passes ({:?})",
            channel, app, passes, self.reconciler.state()
        );
        passes
    }
}
