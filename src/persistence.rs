use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::fs;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

use crate::error::PersistError;
use crate::types::{Channel, TokenMap};
use crate::weblogs::LogSink;

/// One pending request is enough: the writer always reads the latest state.
const FLUSH_QUEUE_SIZE: usize = 1;

/// Reads and writes one channel's token file.
#[derive(Debug, Clone)]
pub struct Persister {
    channel: Channel,
    path: PathBuf,
}

impl Persister {
    pub fn new(data_dir: &Path, channel: Channel) -> Persister {
        Persister {
            channel,
            path: data_dir.join(channel.file_name()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Restores the token map. A missing or unreadable file yields an empty map.
    pub async fn load(&self) -> TokenMap {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No {} token file at {}, starting empty", self.channel, self.path.display());
                return TokenMap::new();
            }
            Err(e) => {
                warn!("Could not read {}: {}, starting empty", self.path.display(), e);
                return TokenMap::new();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(tokens) => self.dedup(tokens),
            Err(e) => {
                warn!("Corrupt {} token file {}: {}, starting empty", self.channel, self.path.display(), e);
                TokenMap::new()
            }
        }
    }

    /// Drops repeated tokens per app, keeping the first occurrence.
    fn dedup(&self, mut tokens: TokenMap) -> TokenMap {
        let mut dropped = 0;
        for app_tokens in tokens.values_mut() {
            let mut seen = HashSet::with_capacity(app_tokens.len());
            let before = app_tokens.len();
            app_tokens.retain(|token| seen.insert(token.clone()));
            dropped += before - app_tokens.len();
        }
        if dropped > 0 {
            warn!("Dropped {} duplicate {} tokens from {}", dropped, self.channel, self.path.display());
        }
        tokens
    }

    /// Overwrites the token file with `snapshot` via write-then-rename.
    pub async fn flush(&self, snapshot: &TokenMap) -> Result<(), PersistError> {
        let data = serde_json::to_vec(snapshot)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Starts the background writer draining flush requests for `tokens`.
    pub fn spawn_writer(self, tokens: Arc<RwLock<TokenMap>>, sink: LogSink) -> FlushHandle {
        let (tx, mut rx) = mpsc::channel::<()>(FLUSH_QUEUE_SIZE);
        let channel = self.channel;

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Lock held only for the copy, never for the I/O
                let snapshot = tokens.read().await.clone();
                match self.flush(&snapshot).await {
                    Ok(()) => debug!("persist:: {} flushed to {}", self.channel, self.path.display()),
                    Err(e) => {
                        error!("Failed to persist {} tokens to {}: {}", self.channel, self.path.display(), e);
                        sink.emit(self.channel, format!("WARNING: tokens not persisted: {e}"));
                    }
                }
            }
            debug!("persist:: {} writer stopped", self.channel);
        });

        FlushHandle { channel, tx }
    }
}

/// Enqueues flushes for a store's writer without waiting on I/O.
#[derive(Debug, Clone)]
pub struct FlushHandle {
    channel: Channel,
    tx: mpsc::Sender<()>,
}

impl FlushHandle {
    pub fn request(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => {
                error!("{} writer has stopped, tokens are no longer persisted", self.channel)
            }
        }
    }
}
