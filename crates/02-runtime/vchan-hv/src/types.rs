use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use vchan_ring::SharedPage;

/// Identifier of an isolated domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(pub u16);

impl DomainId {
    /// The privileged control domain.
    pub const CONTROL: DomainId = DomainId(0);

    /// Directory home; relative directory paths resolve below it.
    pub fn home(self) -> String {
        format!("/local/domain/{}", self.0)
    }
}

/// Grant reference naming a page one domain offers to another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GrantRef(pub u32);

/// Machine frame number of a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameNumber(pub u64);

/// Event channel port number, local to the domain that bound it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port(pub u32);

/// Provider-issued token for one allocation or mapping; the release call takes it back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MappingId(pub u64);

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        })*
    };
}

display_inner!(DomainId, GrantRef, FrameNumber, Port, MappingId);

/// A page allocated by this domain and offered to others.
///
/// `reference` is what the peer needs to map it: a grant reference for grant
/// table allocations, a frame number for frame allocations.
#[derive(Debug)]
pub struct AllocatedPage {
    pub id: MappingId,
    pub reference: u64,
    pub page: Arc<SharedPage>,
}

/// A page owned by another domain and mapped into this one.
#[derive(Debug)]
pub struct MappedPage {
    pub id: MappingId,
    pub page: Arc<SharedPage>,
}

/// Binding state of a local port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortStatus {
    /// Offered to `remote`, which has not bound to it yet.
    Unbound { remote: DomainId },
    /// Connected to `remote_port` in `remote`.
    Interdomain { remote: DomainId, remote_port: Port },
    /// The remote end went away; notifications are dropped.
    Closed,
}

/// Result of waiting on a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A notification was delivered; the port is masked until unmasked.
    Notified,
    /// The timeout elapsed first.
    TimedOut,
    /// The remote end closed while waiting.
    Closed,
}
