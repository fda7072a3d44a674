//! In-process hypervisor used by tests and the loopback demo.
//!
//! All simulated domains share one [`World`] behind a `parking_lot` mutex.
//! Blocking event channel waits park on a single condvar and re-check their
//! own port after every wake-up. Destroying a domain closes its ports, drops
//! its directory subtree and wakes every waiter, which is how a peer's death
//! becomes observable to the survivor.

mod events;
mod memory;
mod store;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;
use vchan_ring::SharedPage;

use crate::types::{DomainId, FrameNumber, GrantRef, MappingId, Port};
use crate::{HvContext, HvError, HvResult};

pub(crate) use events::PortEntry;

/// Provider call that the loopback hypervisor can be told to fail once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    GrantPage,
    AllocFrame,
    MapGrantRef,
    MapForeignRange,
    OpenEventChannel,
    BindUnbound,
    BindInterdomain,
    Notify,
    OpenDirectory,
    /// Fails the next directory write whose path ends with the given key.
    DirectoryWrite(&'static str),
    DirectoryRemove,
}

/// The call used to give a page or mapping back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseCall {
    RevokeGrant,
    FreeFrame,
    UnmapGrantRef,
    UnmapForeignRange,
}

impl ReleaseCall {
    pub fn name(self) -> &'static str {
        match self {
            ReleaseCall::RevokeGrant => "revoke_grant",
            ReleaseCall::FreeFrame => "free_frame",
            ReleaseCall::UnmapGrantRef => "unmap_grant_ref",
            ReleaseCall::UnmapForeignRange => "unmap_foreign_range",
        }
    }
}

/// One successful release, in the order it happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReleaseRecord {
    pub domain: DomainId,
    pub id: MappingId,
    pub call: ReleaseCall,
}

/// Live resource counts across all domains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    /// Pages allocated by a domain (granted pages and frames).
    pub allocations: usize,
    /// Foreign pages mapped into a domain.
    pub mappings: usize,
    pub open_event_channels: usize,
    pub bound_ports: usize,
    pub directory_sessions: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RegionKind {
    Granted { gref: GrantRef, to: DomainId },
    Frame { frame: FrameNumber },
    GrantMapped,
    RangeMapped,
}

impl RegionKind {
    fn release_call(self) -> ReleaseCall {
        match self {
            RegionKind::Granted { .. } => ReleaseCall::RevokeGrant,
            RegionKind::Frame { .. } => ReleaseCall::FreeFrame,
            RegionKind::GrantMapped => ReleaseCall::UnmapGrantRef,
            RegionKind::RangeMapped => ReleaseCall::UnmapForeignRange,
        }
    }

    fn created_by(self) -> &'static str {
        match self {
            RegionKind::Granted { .. } => "grant_page",
            RegionKind::Frame { .. } => "alloc_frame",
            RegionKind::GrantMapped => "map_grant_ref",
            RegionKind::RangeMapped => "map_foreign_range",
        }
    }

    fn is_mapping(self) -> bool {
        matches!(self, RegionKind::GrantMapped | RegionKind::RangeMapped)
    }
}

pub(crate) struct Region {
    pub(crate) owner: DomainId,
    pub(crate) kind: RegionKind,
    pub(crate) page: Arc<SharedPage>,
}

pub(crate) struct World {
    domains: BTreeMap<DomainId, bool>,
    next_domain: u16,
    pub(crate) store: BTreeMap<String, String>,
    pub(crate) regions: HashMap<MappingId, Region>,
    next_region: u64,
    pub(crate) next_gref: u32,
    pub(crate) next_frame: u64,
    pub(crate) ports: HashMap<(DomainId, Port), PortEntry>,
    next_port: HashMap<DomainId, u32>,
    next_handle: u64,
    pub(crate) open_handles: HashSet<u64>,
    pub(crate) sessions: usize,
    faults: Vec<Fault>,
    releases: Vec<ReleaseRecord>,
}

impl World {
    fn new() -> Self {
        let mut domains = BTreeMap::new();
        domains.insert(DomainId::CONTROL, true);
        Self {
            domains,
            next_domain: 1,
            store: BTreeMap::new(),
            regions: HashMap::new(),
            next_region: 1,
            // Low grant references are reserved by real guests.
            next_gref: 8,
            next_frame: 0x1_0000,
            ports: HashMap::new(),
            next_port: HashMap::new(),
            next_handle: 1,
            open_handles: HashSet::new(),
            sessions: 0,
            faults: Vec::new(),
            releases: Vec::new(),
        }
    }

    pub(crate) fn is_alive(&self, domain: DomainId) -> bool {
        self.domains.get(&domain).copied().unwrap_or(false)
    }

    pub(crate) fn ensure_alive(&self, domain: DomainId) -> HvResult<()> {
        if self.is_alive(domain) {
            Ok(())
        } else {
            Err(HvError::NoSuchDomain(domain))
        }
    }

    pub(crate) fn take_fault_matching(&mut self, pred: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let idx = self.faults.iter().position(pred)?;
        Some(self.faults.remove(idx))
    }

    pub(crate) fn take_fault(&mut self, fault: Fault) -> bool {
        self.take_fault_matching(|f| *f == fault).is_some()
    }

    pub(crate) fn insert_region(
        &mut self,
        owner: DomainId,
        kind: RegionKind,
        page: Arc<SharedPage>,
    ) -> MappingId {
        let id = MappingId(self.next_region);
        self.next_region += 1;
        self.regions.insert(id, Region { owner, kind, page });
        id
    }

    pub(crate) fn release(
        &mut self,
        domain: DomainId,
        id: MappingId,
        call: ReleaseCall,
    ) -> HvResult<()> {
        let region = self
            .regions
            .get(&id)
            .filter(|region| region.owner == domain)
            .ok_or(HvError::UnknownMapping(id))?;
        if region.kind.release_call() != call {
            return Err(HvError::MismatchedRelease {
                id,
                created: region.kind.created_by(),
                attempted: call.name(),
            });
        }
        self.regions.remove(&id);
        self.releases.push(ReleaseRecord { domain, id, call });
        debug!(%domain, %id, call = call.name(), "released page");
        Ok(())
    }

    pub(crate) fn alloc_port(&mut self, domain: DomainId) -> Port {
        let next = self.next_port.entry(domain).or_insert(1);
        let port = Port(*next);
        *next += 1;
        port
    }

    pub(crate) fn alloc_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.open_handles.insert(handle);
        handle
    }

    /// Removes a port and marks its interdomain peer closed.
    pub(crate) fn drop_port(&mut self, domain: DomainId, port: Port) -> Option<PortEntry> {
        let entry = self.ports.remove(&(domain, port))?;
        if let crate::PortStatus::Interdomain {
            remote,
            remote_port,
        } = entry.status
        {
            if let Some(peer) = self.ports.get_mut(&(remote, remote_port)) {
                peer.status = crate::PortStatus::Closed;
            }
        }
        Some(entry)
    }

    pub(crate) fn remove_subtree(&mut self, path: &str) {
        let prefix = format!("{path}/");
        self.store
            .retain(|key, _| key != path && !key.starts_with(&prefix));
    }
}

pub(crate) struct Shared {
    pub(crate) world: Mutex<World>,
    pub(crate) wake: Condvar,
}

/// A simulated hypervisor hosting any number of domains in one process.
///
/// Domain 0 exists from the start; [`LoopbackHypervisor::create_domain`] adds
/// more. Each domain gets its own [`HvContext`] via
/// [`LoopbackHypervisor::context`].
#[derive(Clone)]
pub struct LoopbackHypervisor {
    shared: Arc<Shared>,
}

impl Default for LoopbackHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHypervisor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                world: Mutex::new(World::new()),
                wake: Condvar::new(),
            }),
        }
    }

    pub fn create_domain(&self) -> DomainId {
        let mut world = self.shared.world.lock();
        let id = DomainId(world.next_domain);
        world.next_domain += 1;
        world.domains.insert(id, true);
        debug!(domain = %id, "created domain");
        id
    }

    /// Destroys `domain`: its ports close, its directory home disappears and
    /// every blocked waiter is woken. Pages it allocated are reclaimed.
    pub fn destroy_domain(&self, domain: DomainId) {
        {
            let mut world = self.shared.world.lock();
            match world.domains.get_mut(&domain) {
                Some(alive) if *alive => *alive = false,
                _ => return,
            }
            let owned: Vec<Port> = world
                .ports
                .keys()
                .filter(|(owner, _)| *owner == domain)
                .map(|(_, port)| *port)
                .collect();
            for port in owned {
                world.drop_port(domain, port);
            }
            world.regions.retain(|_, region| region.owner != domain);
            world.remove_subtree(&domain.home());
            debug!(%domain, "destroyed domain");
        }
        self.shared.wake.notify_all();
    }

    pub fn is_alive(&self, domain: DomainId) -> bool {
        self.shared.world.lock().is_alive(domain)
    }

    /// Provider context acting on behalf of `domain`.
    pub fn context(&self, domain: DomainId) -> HvContext {
        let provider = Arc::new(LoopbackDomain {
            shared: Arc::clone(&self.shared),
            id: domain,
        });
        HvContext {
            grants: provider.clone(),
            foreign: provider.clone(),
            events: provider.clone(),
            store: provider.clone(),
            domains: provider,
        }
    }

    /// Makes the next matching provider call fail.
    pub fn inject(&self, fault: Fault) {
        self.shared.world.lock().faults.push(fault);
    }

    pub fn stats(&self) -> LoopbackStats {
        let world = self.shared.world.lock();
        let mappings = world
            .regions
            .values()
            .filter(|region| region.kind.is_mapping())
            .count();
        LoopbackStats {
            allocations: world.regions.len() - mappings,
            mappings,
            open_event_channels: world.open_handles.len(),
            bound_ports: world.ports.len(),
            directory_sessions: world.sessions,
        }
    }

    /// Every release performed so far, oldest first.
    pub fn release_log(&self) -> Vec<ReleaseRecord> {
        self.shared.world.lock().releases.clone()
    }

    /// Reads an absolute directory path with toolstack privileges.
    pub fn read_store(&self, path: &str) -> Option<String> {
        self.shared.world.lock().store.get(path).cloned()
    }

    /// Writes an absolute directory path with toolstack privileges.
    pub fn write_store(&self, path: &str, value: &str) {
        self.shared
            .world
            .lock()
            .store
            .insert(path.to_owned(), value.to_owned());
    }

    /// All directory paths at or below `prefix`.
    pub fn store_paths(&self, prefix: &str) -> Vec<String> {
        let nested = format!("{prefix}/");
        self.shared
            .world
            .lock()
            .store
            .keys()
            .filter(|key| *key == prefix || key.starts_with(&nested))
            .cloned()
            .collect()
    }
}

/// Provider implementation for one domain of a [`LoopbackHypervisor`].
pub(crate) struct LoopbackDomain {
    pub(crate) shared: Arc<Shared>,
    pub(crate) id: DomainId,
}

impl crate::DomainControl for LoopbackDomain {
    fn self_id(&self) -> DomainId {
        self.id
    }

    fn is_alive(&self, domain: DomainId) -> HvResult<bool> {
        Ok(self.shared.world.lock().is_alive(domain))
    }
}
