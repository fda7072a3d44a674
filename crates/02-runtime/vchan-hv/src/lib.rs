//! Hypervisor-facing interfaces used by the vchan handshake.
//!
//! * [`HvContext`] – explicit bundle of the providers a domain talks to.
//! * [`GrantTable`] / [`ForeignMemory`] – the two page sharing families.
//! * [`EventChannels`] / [`EventChannel`] – cross-domain notification ports.
//! * [`DirectoryService`] / [`DirectorySession`] – the rendezvous store.
//! * [`DomainControl`] – domain identity and liveness.
//! * [`loopback`] – an in-process hypervisor simulating several domains.

mod error;
pub mod loopback;
mod provider;
mod types;

pub use error::{HvError, HvResult};
pub use provider::{
    DirectoryService, DirectorySession, DomainControl, EventChannel, EventChannels,
    ForeignMemory, GrantTable, HvContext,
};
pub use types::{
    AllocatedPage, DomainId, FrameNumber, GrantRef, MappedPage, MappingId, Port, PortStatus,
    WaitOutcome,
};
