use std::sync::Arc;

use tracing::trace;
use vchan_ring::SharedPage;

use super::{Fault, LoopbackDomain, RegionKind, ReleaseCall};
use crate::types::{AllocatedPage, DomainId, FrameNumber, GrantRef, MappedPage, MappingId};
use crate::{ForeignMemory, GrantTable, HvError, HvResult};

impl GrantTable for LoopbackDomain {
    fn grant_page(&self, peer: DomainId) -> HvResult<AllocatedPage> {
        let mut world = self.shared.world.lock();
        world.ensure_alive(self.id)?;
        if world.take_fault(Fault::GrantPage) {
            return Err(HvError::provider("grant table exhausted"));
        }
        let page = Arc::new(SharedPage::allocate()?);
        let gref = GrantRef(world.next_gref);
        world.next_gref += 1;
        let id = world.insert_region(
            self.id,
            RegionKind::Granted { gref, to: peer },
            Arc::clone(&page),
        );
        trace!(domain = %self.id, %peer, %gref, "granted page");
        Ok(AllocatedPage {
            id,
            reference: u64::from(gref.0),
            page,
        })
    }

    fn revoke_grant(&self, id: MappingId) -> HvResult<()> {
        self.shared
            .world
            .lock()
            .release(self.id, id, ReleaseCall::RevokeGrant)
    }

    fn map_grant_ref(&self, domain: DomainId, gref: GrantRef) -> HvResult<MappedPage> {
        let mut world = self.shared.world.lock();
        world.ensure_alive(self.id)?;
        world.ensure_alive(domain)?;
        if world.take_fault(Fault::MapGrantRef) {
            return Err(HvError::provider("grant mapping failed"));
        }
        let page = world
            .regions
            .values()
            .find_map(|region| match region.kind {
                RegionKind::Granted { gref: g, to }
                    if region.owner == domain && g == gref && to == self.id =>
                {
                    Some(Arc::clone(&region.page))
                }
                _ => None,
            })
            .ok_or(HvError::BadGrant { domain, gref })?;
        let page = Arc::new(SharedPage::foreign_view(&page)?);
        let id = world.insert_region(self.id, RegionKind::GrantMapped, Arc::clone(&page));
        trace!(domain = %self.id, from = %domain, %gref, "mapped grant");
        Ok(MappedPage { id, page })
    }

    fn unmap_grant_ref(&self, id: MappingId) -> HvResult<()> {
        self.shared
            .world
            .lock()
            .release(self.id, id, ReleaseCall::UnmapGrantRef)
    }
}

impl ForeignMemory for LoopbackDomain {
    fn alloc_frame(&self) -> HvResult<AllocatedPage> {
        let mut world = self.shared.world.lock();
        world.ensure_alive(self.id)?;
        if world.take_fault(Fault::AllocFrame) {
            return Err(HvError::provider("out of kernel pages"));
        }
        let page = Arc::new(SharedPage::allocate()?);
        let frame = FrameNumber(world.next_frame);
        world.next_frame += 1;
        let id = world.insert_region(self.id, RegionKind::Frame { frame }, Arc::clone(&page));
        trace!(domain = %self.id, %frame, "allocated frame");
        Ok(AllocatedPage {
            id,
            reference: frame.0,
            page,
        })
    }

    fn free_frame(&self, id: MappingId) -> HvResult<()> {
        self.shared
            .world
            .lock()
            .release(self.id, id, ReleaseCall::FreeFrame)
    }

    fn map_foreign_range(&self, domain: DomainId, frame: FrameNumber) -> HvResult<MappedPage> {
        let mut world = self.shared.world.lock();
        world.ensure_alive(self.id)?;
        world.ensure_alive(domain)?;
        if world.take_fault(Fault::MapForeignRange) {
            return Err(HvError::provider("foreign range mapping failed"));
        }
        let page = world
            .regions
            .values()
            .find_map(|region| match region.kind {
                RegionKind::Frame { frame: f } if region.owner == domain && f == frame => {
                    Some(Arc::clone(&region.page))
                }
                _ => None,
            })
            .ok_or(HvError::BadFrame { domain, frame })?;
        let page = Arc::new(SharedPage::foreign_view(&page)?);
        let id = world.insert_region(self.id, RegionKind::RangeMapped, Arc::clone(&page));
        trace!(domain = %self.id, from = %domain, %frame, "mapped foreign range");
        Ok(MappedPage { id, page })
    }

    fn unmap_foreign_range(&self, id: MappingId) -> HvResult<()> {
        self.shared
            .world
            .lock()
            .release(self.id, id, ReleaseCall::UnmapForeignRange)
    }
}
