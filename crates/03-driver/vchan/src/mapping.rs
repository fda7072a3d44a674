use std::fmt;
use std::sync::Arc;

use vchan_hv::{
    AllocatedPage, DomainId, FrameNumber, GrantRef, HvContext, HvResult, MappedPage, MappingId,
};
use vchan_ring::{RingDescriptor, SharedPage};

use crate::config::WireVersion;

/// What a client needs to map a server's ring page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingReference {
    Frame(FrameNumber),
    Grant(GrantRef),
}

impl RingReference {
    pub fn version(self) -> WireVersion {
        match self {
            RingReference::Frame(_) => WireVersion::V1,
            RingReference::Grant(_) => WireVersion::V2,
        }
    }
}

impl fmt::Display for RingReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingReference::Frame(frame) => frame.fmt(f),
            RingReference::Grant(gref) => gref.fmt(f),
        }
    }
}

/// How a handle obtained its ring page, and therefore how it must give it back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingKind {
    /// Server page allocated by frame (v1); freed with `free_frame`.
    ServerFrame,
    /// Server page offered through the grant table (v2); freed with `revoke_grant`.
    ServerGrant,
    /// Client mapping of a foreign frame (v1); released with `unmap_foreign_range`.
    ClientRange,
    /// Client mapping of a grant reference (v2); released with `unmap_grant_ref`.
    ClientGrant,
}

/// The ring page held by one handle.
#[derive(Debug)]
pub(crate) struct RingMapping {
    kind: MappingKind,
    id: MappingId,
    reference: RingReference,
    page: Arc<SharedPage>,
}

impl RingMapping {
    /// Allocates and offers a fresh page to `peer` using the mechanism of `version`.
    pub(crate) fn allocate(ctx: &HvContext, version: WireVersion, peer: DomainId) -> HvResult<Self> {
        let (kind, page) = match version {
            WireVersion::V1 => (MappingKind::ServerFrame, ctx.foreign.alloc_frame()?),
            WireVersion::V2 => (MappingKind::ServerGrant, ctx.grants.grant_page(peer)?),
        };
        let AllocatedPage {
            id,
            reference,
            page,
        } = page;
        let reference = match kind {
            MappingKind::ServerFrame => RingReference::Frame(FrameNumber(reference)),
            _ => match u32::try_from(reference) {
                Ok(gref) => RingReference::Grant(GrantRef(gref)),
                Err(_) => {
                    ctx.grants.revoke_grant(id)?;
                    return Err(vchan_hv::HvError::provider(format!(
                        "grant reference {reference} does not fit 32 bits"
                    )));
                }
            },
        };
        Ok(Self {
            kind,
            id,
            reference,
            page,
        })
    }

    /// Maps the page `domain` offered.
    pub(crate) fn map(ctx: &HvContext, domain: DomainId, reference: RingReference) -> HvResult<Self> {
        let (kind, mapped) = match reference {
            RingReference::Frame(frame) => (
                MappingKind::ClientRange,
                ctx.foreign.map_foreign_range(domain, frame)?,
            ),
            RingReference::Grant(gref) => (
                MappingKind::ClientGrant,
                ctx.grants.map_grant_ref(domain, gref)?,
            ),
        };
        let MappedPage { id, page } = mapped;
        Ok(Self {
            kind,
            id,
            reference,
            page,
        })
    }

    pub(crate) fn kind(&self) -> MappingKind {
        self.kind
    }

    pub(crate) fn reference(&self) -> RingReference {
        self.reference
    }

    pub(crate) fn ring(&self) -> &RingDescriptor {
        self.page.ring()
    }

    /// Returns the page through the call that matches how it was obtained.
    pub(crate) fn release(self, ctx: &HvContext) -> HvResult<()> {
        let Self { kind, id, page, .. } = self;
        // Our view of the page must be gone before the provider reclaims it.
        drop(page);
        match kind {
            MappingKind::ServerFrame => ctx.foreign.free_frame(id),
            MappingKind::ServerGrant => ctx.grants.revoke_grant(id),
            MappingKind::ClientRange => ctx.foreign.unmap_foreign_range(id),
            MappingKind::ClientGrant => ctx.grants.unmap_grant_ref(id),
        }
    }
}
