use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vchan_hv::DomainId;

/// Layout/mapping generation negotiated through the `version` key.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum WireVersion {
    /// Page shared by machine frame number, mapped as a foreign range.
    V1 = 1,
    /// Page shared through the grant table.
    V2 = 2,
}

impl WireVersion {
    /// Assumed when a server publishes no version.
    pub const LOWEST: WireVersion = WireVersion::V1;

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(WireVersion::V1),
            2 => Some(WireVersion::V2),
            _ => None,
        }
    }

    /// Parses the decimal form stored in the directory.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse::<u8>().ok().and_then(Self::from_u8)
    }
}

impl TryFrom<u8> for WireVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or_else(|| format!("unsupported wire version {value}"))
    }
}

impl From<WireVersion> for u8 {
    fn from(version: WireVersion) -> Self {
        version as u8
    }
}

impl fmt::Display for WireVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// How [`crate::Vchan::server_init`] treats the peer's arrival.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitMode {
    /// Block until the client signals, then clean up the rendezvous entries.
    #[default]
    Sync,
    /// Return right after publishing; the caller completes the handshake with
    /// [`crate::Vchan::handle_connected`] once it sees the first signal.
    Deferred,
}

/// Server-side handshake settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Domain allowed to map the page and bind the port.
    pub peer: DomainId,
    pub version: WireVersion,
    pub mode: InitMode,
    /// How often a synchronous server checks that its peer still exists.
    pub liveness_poll_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            peer: DomainId::CONTROL,
            version: WireVersion::V2,
            mode: InitMode::Sync,
            liveness_poll_ms: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn new(peer: DomainId) -> Self {
        Self {
            peer,
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: WireVersion) -> Self {
        self.version = version;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.mode = InitMode::Deferred;
        self
    }

    pub fn with_liveness_poll(mut self, interval: Duration) -> Self {
        self.liveness_poll_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms.max(1))
    }
}
