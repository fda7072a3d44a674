use thiserror::Error;
use vchan_ring::RingError;

use crate::types::{DomainId, FrameNumber, GrantRef, MappingId, Port};

pub type HvResult<T> = Result<T, HvError>;

/// Failures reported by hypervisor providers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HvError {
    #[error("domain {0} does not exist")]
    NoSuchDomain(DomainId),

    #[error("grant reference {gref} of domain {domain} is not offered to this domain")]
    BadGrant { domain: DomainId, gref: GrantRef },

    #[error("frame {frame} of domain {domain} cannot be mapped")]
    BadFrame { domain: DomainId, frame: FrameNumber },

    #[error("unknown page mapping {0}")]
    UnknownMapping(MappingId),

    #[error("mapping {id} was created by {created} and cannot be released by {attempted}")]
    MismatchedRelease {
        id: MappingId,
        created: &'static str,
        attempted: &'static str,
    },

    #[error("invalid event channel port {0}")]
    InvalidPort(Port),

    #[error("port {port} of domain {domain} is not offered for binding")]
    BindRefused { domain: DomainId, port: Port },

    #[error("event channel handle is closed")]
    EndpointClosed,

    #[error("invalid directory path {0:?}")]
    InvalidPath(String),

    #[error("permission denied writing {0:?}")]
    PermissionDenied(String),

    #[error("shared page error: {0}")]
    Page(#[from] RingError),

    #[error("provider failure: {0}")]
    Provider(String),
}

impl HvError {
    pub fn provider(msg: impl Into<String>) -> Self {
        HvError::Provider(msg.into())
    }
}
