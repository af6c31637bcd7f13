use std::collections::HashMap;
use std::fmt;

/// <app, [device_token]>
pub type TokenMap = HashMap<String, Vec<String>>;

/// A push-delivery network. Each one owns its own token store and file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Gcm,
    Apns,
    ApnsSandbox,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Gcm, Channel::Apns, Channel::ApnsSandbox];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Gcm => "GCM",
            Channel::Apns => "APNS",
            Channel::ApnsSandbox => "APNSSandbox",
        }
    }

    /// File holding the channel's tokens under the data directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Channel::Gcm => "gcm.db",
            Channel::Apns => "apns.db",
            Channel::ApnsSandbox => "apns_sandbox.db",
        }
    }

    pub fn is_apns(&self) -> bool {
        matches!(self, Channel::Apns | Channel::ApnsSandbox)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-token result of a provider send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The provider rejected the token for good; it must leave the store.
    Invalid,
    /// The token was superseded by the canonical one carried here.
    Rotated(String),
    /// Transient per-token failure. Logged only.
    Failed(String),
}

/// Which channels a broadcast goes out on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFlags {
    pub gcm: bool,
    pub apns: bool,
    pub apns_sandbox: bool,
}

impl ChannelFlags {
    pub fn channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|channel| self.contains(*channel))
            .collect()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        match channel {
            Channel::Gcm => self.gcm,
            Channel::Apns => self.apns,
            Channel::ApnsSandbox => self.apns_sandbox,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.gcm || self.apns || self.apns_sandbox)
    }
}
