use thiserror::Error;
use vchan_hv::{DomainId, HvError};
use vchan_ring::RingError;

use crate::ChannelNumber;

pub type VchanResult<T> = Result<T, VchanError>;

#[derive(Debug, Error)]
pub enum VchanError {
    /// Nobody is listening on the channel, or what was published is unusable.
    #[error("no usable listener on channel {channel} of domain {domain}: {reason}")]
    Discovery {
        domain: DomainId,
        channel: ChannelNumber,
        reason: DiscoveryFailure,
    },

    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] HvError),

    #[error("corrupt or unusable ring: {0}")]
    CorruptRing(#[from] RingError),

    #[error("peer domain {0} went away before connecting")]
    PeerGone(DomainId),

    #[error("connection has been torn down")]
    TornDown,
}

impl VchanError {
    /// True for "nobody is listening" failures; callers should not retry blindly.
    pub fn is_discovery(&self) -> bool {
        matches!(self, VchanError::Discovery { .. })
    }
}

/// Why a published rendezvous entry could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryFailure {
    #[error("{key} is missing")]
    Missing { key: &'static str },

    #[error("{key} is zero")]
    Zero { key: &'static str },

    #[error("{key} holds malformed value {value:?}")]
    Malformed { key: &'static str, value: String },

    #[error("unsupported wire version {0:?}")]
    UnsupportedVersion(String),
}
