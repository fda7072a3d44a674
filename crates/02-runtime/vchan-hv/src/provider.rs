//! Provider traits and the context that bundles them.
//!
//! Every handshake and teardown call receives an [`HvContext`] explicitly;
//! nothing in the channel layer reaches for process-global hypervisor
//! handles. Resources that must be closed (event channel handles, directory
//! sessions) are returned as boxed objects that release themselves on drop.

use std::sync::Arc;
use std::time::Duration;

use crate::types::{
    AllocatedPage, DomainId, FrameNumber, GrantRef, MappedPage, MappingId, Port, PortStatus,
    WaitOutcome,
};
use crate::HvResult;

/// Grant-table page sharing (wire version 2).
pub trait GrantTable: Send + Sync {
    /// Allocates a zeroed page and grants `peer` read/write access to it.
    fn grant_page(&self, peer: DomainId) -> HvResult<AllocatedPage>;
    /// Ends the grant and frees a page returned by [`GrantTable::grant_page`].
    fn revoke_grant(&self, id: MappingId) -> HvResult<()>;
    /// Maps a page `domain` granted to us.
    fn map_grant_ref(&self, domain: DomainId, gref: GrantRef) -> HvResult<MappedPage>;
    /// Unmaps a page mapped by [`GrantTable::map_grant_ref`].
    fn unmap_grant_ref(&self, id: MappingId) -> HvResult<()>;
}

/// Frame-based page sharing (wire version 1).
pub trait ForeignMemory: Send + Sync {
    /// Allocates a zeroed page and reports its machine frame number.
    fn alloc_frame(&self) -> HvResult<AllocatedPage>;
    /// Frees a page returned by [`ForeignMemory::alloc_frame`].
    fn free_frame(&self, id: MappingId) -> HvResult<()>;
    /// Maps one frame belonging to `domain` as a foreign range.
    fn map_foreign_range(&self, domain: DomainId, frame: FrameNumber) -> HvResult<MappedPage>;
    /// Unmaps a range mapped by [`ForeignMemory::map_foreign_range`].
    fn unmap_foreign_range(&self, id: MappingId) -> HvResult<()>;
}

/// Opens event channel handles.
pub trait EventChannels: Send + Sync {
    fn open(&self) -> HvResult<Box<dyn EventChannel>>;
}

/// An open event channel handle. Ports bound through it belong to it.
///
/// Dropping the handle closes it and unbinds whatever is still bound.
pub trait EventChannel: Send {
    /// Allocates a port that `remote` may later bind to.
    fn bind_unbound(&mut self, remote: DomainId) -> HvResult<Port>;
    /// Connects a new local port to `remote_port` offered by `remote`.
    fn bind_interdomain(&mut self, remote: DomainId, remote_port: Port) -> HvResult<Port>;
    fn unbind(&mut self, port: Port) -> HvResult<()>;
    /// Signals the remote end of `port`.
    fn notify(&self, port: Port) -> HvResult<()>;
    /// Re-enables delivery after a notification was consumed.
    fn unmask(&self, port: Port) -> HvResult<()>;
    /// Whether a notification is waiting, without consuming it.
    fn is_pending(&self, port: Port) -> HvResult<bool>;
    /// Consumes a waiting notification, returning whether there was one.
    fn clear_pending(&self, port: Port) -> HvResult<bool>;
    /// Blocks until a notification arrives on `port`, the remote end closes,
    /// or `timeout` elapses (`None` waits indefinitely).
    fn wait(&self, port: Port, timeout: Option<Duration>) -> HvResult<WaitOutcome>;
    fn status(&self, port: Port) -> HvResult<PortStatus>;
    /// Closes the handle. Safe to call more than once.
    fn close(&mut self) -> HvResult<()>;
}

/// Opens sessions on the rendezvous directory.
pub trait DirectoryService: Send + Sync {
    fn open(&self) -> HvResult<Box<dyn DirectorySession>>;
}

/// One connection to the rendezvous directory, closed on drop.
///
/// Paths without a leading `/` are relative to the caller's own home,
/// `/local/domain/<id>`.
pub trait DirectorySession: Send {
    fn read(&self, path: &str) -> HvResult<Option<String>>;
    fn write(&self, path: &str, value: &str) -> HvResult<()>;
    /// Removes `path` and everything below it. Removing a missing path succeeds.
    fn remove(&self, path: &str) -> HvResult<()>;
}

/// Domain identity and liveness queries.
pub trait DomainControl: Send + Sync {
    fn self_id(&self) -> DomainId;
    /// Whether `domain` currently exists.
    fn is_alive(&self, domain: DomainId) -> HvResult<bool>;
}

/// Explicit hypervisor context for one domain.
#[derive(Clone)]
pub struct HvContext {
    pub grants: Arc<dyn GrantTable>,
    pub foreign: Arc<dyn ForeignMemory>,
    pub events: Arc<dyn EventChannels>,
    pub store: Arc<dyn DirectoryService>,
    pub domains: Arc<dyn DomainControl>,
}

impl HvContext {
    /// Domain this context acts on behalf of.
    pub fn domain(&self) -> DomainId {
        self.domains.self_id()
    }
}

impl std::fmt::Debug for HvContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HvContext")
            .field("domain", &self.domain())
            .finish_non_exhaustive()
    }
}
