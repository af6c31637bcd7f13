use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::RwLock;

use crate::persistence::{FlushHandle, Persister};
use crate::types::{Channel, TokenMap};
use crate::util::get_short_token;
use crate::weblogs::LogSink;

/// The device tokens of one channel, keyed by application.
///
/// Reads share the lock, mutations take it exclusively for the whole
/// read-modify-write. Clones share the same map.
#[derive(Clone)]
pub struct TokenStore {
    channel: Channel,
    tokens: Arc<RwLock<TokenMap>>,
    flush: Option<FlushHandle>,
}

impl TokenStore {
    /// A store that lives only in memory.
    #[cfg(test)]
    pub fn new(channel: Channel) -> TokenStore {
        TokenStore {
            channel,
            tokens: Arc::new(RwLock::new(TokenMap::new())),
            flush: None,
        }
    }

    /// Loads the store from `persister` and keeps it flushed there.
    pub async fn open(channel: Channel, persister: Persister, sink: LogSink) -> TokenStore {
        let tokens = persister.load().await;
        info!("{} {} apps loaded from {}", tokens.len(), channel, persister.path().display());
        let tokens = Arc::new(RwLock::new(tokens));
        let flush = persister.spawn_writer(Arc::clone(&tokens), sink);
        TokenStore {
            channel,
            tokens,
            flush: Some(flush),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub async fn add(&self, app: &str, token: &str) {
        {
            let mut tokens = self.tokens.write().await;
            let app_tokens = tokens.entry(app.to_string()).or_default();
            if app_tokens.iter().any(|t| t == token) {
                debug!("{} token already registered: ...{} for the app: {}", self.channel, get_short_token(token), app);
                return;
            }
            app_tokens.push(token.to_string());
        }
        info!("{} token added: ...{} for the app: {}", self.channel, get_short_token(token), app);
        self.request_flush();
    }

    pub async fn remove(&self, app: &str, token: &str) {
        let removed = {
            let mut tokens = self.tokens.write().await;
            let mut now_empty = false;
            let removed = match tokens.get_mut(app) {
                Some(app_tokens) => match app_tokens.iter().position(|t| t == token) {
                    Some(position) => {
                        app_tokens.remove(position);
                        now_empty = app_tokens.is_empty();
                        true
                    }
                    None => false,
                },
                None => false,
            };
            if now_empty {
                tokens.remove(app);
            }
            removed
        };

        if removed {
            info!("{} token removed: ...{} for the app: {}", self.channel, get_short_token(token), app);
            self.request_flush();
        } else {
            debug!("{} no token to remove: ...{} for the app: {}", self.channel, get_short_token(token), app);
        }
    }

    /// Copy of the app's tokens in insertion order.
    pub async fn list(&self, app: &str) -> Vec<String> {
        self.tokens.read().await.get(app).cloned().unwrap_or_default()
    }

    pub async fn count(&self, app: &str) -> usize {
        self.tokens.read().await.get(app).map(Vec::len).unwrap_or(0)
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> TokenMap {
        self.tokens.read().await.clone()
    }

    fn request_flush(&self) {
        if let Some(flush) = &self.flush {
            flush.request();
        }
    }
}

/// One token store per channel, built once at startup and shared.
#[derive(Clone)]
pub struct Registry {
    gcm: TokenStore,
    apns: TokenStore,
    apns_sandbox: TokenStore,
}

impl Registry {
    #[cfg(test)]
    pub fn in_memory() -> Registry {
        Registry {
            gcm: TokenStore::new(Channel::Gcm),
            apns: TokenStore::new(Channel::Apns),
            apns_sandbox: TokenStore::new(Channel::ApnsSandbox),
        }
    }

    /// Restores every channel from `data_dir` and starts their writers.
    pub async fn load(data_dir: &Path, sink: LogSink) -> Registry {
        let open = |channel| TokenStore::open(channel, Persister::new(data_dir, channel), sink.clone());
        Registry {
            gcm: open(Channel::Gcm).await,
            apns: open(Channel::Apns).await,
            apns_sandbox: open(Channel::ApnsSandbox).await,
        }
    }

    pub fn store(&self, channel: Channel) -> &TokenStore {
        match channel {
            Channel::Gcm => &self.gcm,
            Channel::Apns => &self.apns,
            Channel::ApnsSandbox => &self.apns_sandbox,
        }
    }

    pub async fn add_token(&self, channel: Channel, app: &str, token: &str) {
        self.store(channel).add(app, token).await
    }

    pub async fn remove_token(&self, channel: Channel, app: &str, token: &str) {
        self.store(channel).remove(app, token).await
    }

    pub async fn list_tokens(&self, channel: Channel, app: &str) -> Vec<String> {
        self.store(channel).list(app).await
    }

    pub async fn count_tokens(&self, channel: Channel, app: &str) -> usize {
        self.store(channel).count(app).await
    }
}
