//! Ordered record of everything a handle holds.
//!
//! Each handshake step pushes what it acquired. Releasing walks the stack from
//! the top, so a failed handshake unwinds exactly what it built and a live
//! handle tears down in the order peers expect: rendezvous entries first,
//! then the notification endpoint, then the page.

use smallvec::SmallVec;
use tracing::{debug, warn};
use vchan_hv::{HvContext, HvResult};

use crate::endpoint::NotifyEndpoint;
use crate::mapping::RingMapping;
use crate::rendezvous::{self, ChannelNumber};

#[derive(Debug)]
pub(crate) enum Resource {
    Page(RingMapping),
    Endpoint(NotifyEndpoint),
    Rendezvous(ChannelNumber),
}

impl Resource {
    fn name(&self) -> &'static str {
        match self {
            Resource::Page(_) => "page",
            Resource::Endpoint(_) => "endpoint",
            Resource::Rendezvous(_) => "rendezvous",
        }
    }

    fn release(self, ctx: &HvContext) -> HvResult<()> {
        match self {
            Resource::Page(mapping) => mapping.release(ctx),
            Resource::Endpoint(endpoint) => endpoint.release(),
            Resource::Rendezvous(channel) => {
                let session = ctx.store.open()?;
                rendezvous::remove(session.as_ref(), channel)
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct Resources {
    ctx: HvContext,
    held: SmallVec<[Resource; 3]>,
}

impl Resources {
    pub(crate) fn new(ctx: HvContext) -> Self {
        Self {
            ctx,
            held: SmallVec::new(),
        }
    }

    pub(crate) fn ctx(&self) -> &HvContext {
        &self.ctx
    }

    pub(crate) fn push(&mut self, resource: Resource) {
        self.held.push(resource);
    }

    pub(crate) fn page(&self) -> Option<&RingMapping> {
        self.held.iter().find_map(|resource| match resource {
            Resource::Page(mapping) => Some(mapping),
            _ => None,
        })
    }

    pub(crate) fn endpoint(&self) -> Option<&NotifyEndpoint> {
        self.held.iter().find_map(|resource| match resource {
            Resource::Endpoint(endpoint) => Some(endpoint),
            _ => None,
        })
    }

    pub(crate) fn rendezvous(&self) -> Option<ChannelNumber> {
        self.held.iter().find_map(|resource| match resource {
            Resource::Rendezvous(channel) => Some(*channel),
            _ => None,
        })
    }

    /// Forgets the rendezvous entry after the caller removed it from the directory.
    pub(crate) fn forget_rendezvous(&mut self) {
        self.held
            .retain(|resource| !matches!(resource, Resource::Rendezvous(_)));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Releases everything, newest first. Failures are logged and skipped.
    /// Returns how many releases failed.
    pub(crate) fn release_all(&mut self) -> usize {
        let mut failures = 0;
        while let Some(resource) = self.held.pop() {
            let name = resource.name();
            match resource.release(&self.ctx) {
                Ok(()) => debug!(resource = name, "released"),
                Err(err) => {
                    failures += 1;
                    warn!(resource = name, error = %err, "release failed");
                }
            }
        }
        failures
    }
}

impl Drop for Resources {
    fn drop(&mut self) {
        self.release_all();
    }
}
