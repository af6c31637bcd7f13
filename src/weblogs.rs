use log::info;
use tokio::sync::broadcast;

use crate::types::Channel;

const STREAM_CAPACITY: usize = 256;

/// One of the progress streams operators can follow live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Gcm,
    Apns,
}

impl LogStream {
    pub fn parse(name: &str) -> Option<LogStream> {
        match name {
            "gcm" => Some(LogStream::Gcm),
            "apns" => Some(LogStream::Apns),
            _ => None,
        }
    }
}

impl From<Channel> for LogStream {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Gcm => LogStream::Gcm,
            Channel::Apns | Channel::ApnsSandbox => LogStream::Apns,
        }
    }
}

/// Where the engine reports progress. Nobody has to be listening.
#[derive(Clone)]
pub struct LogSink {
    gcm: broadcast::Sender<String>,
    apns: broadcast::Sender<String>,
}

impl LogSink {
    pub fn new() -> LogSink {
        let (gcm, _) = broadcast::channel(STREAM_CAPACITY);
        let (apns, _) = broadcast::channel(STREAM_CAPACITY);
        LogSink { gcm, apns }
    }

    pub fn emit(&self, channel: Channel, line: impl Into<String>) {
        let line = line.into();
        info!("[{}] {}", channel, line);
        // No subscribers is fine
        self.sender(channel.into()).send(line).ok();
    }

    pub fn subscribe(&self, stream: LogStream) -> broadcast::Receiver<String> {
        self.sender(stream).subscribe()
    }

    fn sender(&self, stream: LogStream) -> &broadcast::Sender<String> {
        match stream {
            LogStream::Gcm => &self.gcm,
            LogStream::Apns => &self.apns,
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        LogSink::new()
    }
}
