use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use super::{Fault, LoopbackDomain, Shared, World};
use crate::types::{DomainId, Port, PortStatus, WaitOutcome};
use crate::{EventChannel, EventChannels, HvError, HvResult};

pub(crate) struct PortEntry {
    handle: u64,
    pub(crate) status: PortStatus,
    pending: bool,
    masked: bool,
}

impl EventChannels for LoopbackDomain {
    fn open(&self) -> HvResult<Box<dyn EventChannel>> {
        let mut world = self.shared.world.lock();
        world.ensure_alive(self.id)?;
        if world.take_fault(Fault::OpenEventChannel) {
            return Err(HvError::provider("no free event channel handles"));
        }
        let handle = world.alloc_handle();
        Ok(Box::new(LoopbackEventChannel {
            shared: Arc::clone(&self.shared),
            domain: self.id,
            handle,
            closed: false,
        }))
    }
}

struct LoopbackEventChannel {
    shared: Arc<Shared>,
    domain: DomainId,
    handle: u64,
    closed: bool,
}

impl LoopbackEventChannel {
    fn entry_mut<'w>(&self, world: &'w mut World, port: Port) -> HvResult<&'w mut PortEntry> {
        if self.closed {
            return Err(HvError::EndpointClosed);
        }
        world
            .ports
            .get_mut(&(self.domain, port))
            .filter(|entry| entry.handle == self.handle)
            .ok_or(HvError::InvalidPort(port))
    }

    fn insert(&self, world: &mut World, status: PortStatus) -> Port {
        let port = world.alloc_port(self.domain);
        world.ports.insert(
            (self.domain, port),
            PortEntry {
                handle: self.handle,
                status,
                pending: false,
                masked: false,
            },
        );
        port
    }
}

impl EventChannel for LoopbackEventChannel {
    fn bind_unbound(&mut self, remote: DomainId) -> HvResult<Port> {
        if self.closed {
            return Err(HvError::EndpointClosed);
        }
        let mut world = self.shared.world.lock();
        world.ensure_alive(self.domain)?;
        if world.take_fault(Fault::BindUnbound) {
            return Err(HvError::provider("no free ports"));
        }
        let port = self.insert(&mut world, PortStatus::Unbound { remote });
        trace!(domain = %self.domain, %port, %remote, "bound unbound port");
        Ok(port)
    }

    fn bind_interdomain(&mut self, remote: DomainId, remote_port: Port) -> HvResult<Port> {
        if self.closed {
            return Err(HvError::EndpointClosed);
        }
        let mut world = self.shared.world.lock();
        world.ensure_alive(self.domain)?;
        world.ensure_alive(remote)?;
        if world.take_fault(Fault::BindInterdomain) {
            return Err(HvError::provider("no free ports"));
        }
        let offered = matches!(
            world.ports.get(&(remote, remote_port)).map(|entry| entry.status),
            Some(PortStatus::Unbound { remote: r }) if r == self.domain
        );
        if !offered {
            return Err(HvError::BindRefused {
                domain: remote,
                port: remote_port,
            });
        }
        let port = self.insert(
            &mut world,
            PortStatus::Interdomain {
                remote,
                remote_port,
            },
        );
        if let Some(peer) = world.ports.get_mut(&(remote, remote_port)) {
            peer.status = PortStatus::Interdomain {
                remote: self.domain,
                remote_port: port,
            };
        }
        trace!(domain = %self.domain, %port, %remote, %remote_port, "bound interdomain port");
        Ok(port)
    }

    fn unbind(&mut self, port: Port) -> HvResult<()> {
        {
            let mut world = self.shared.world.lock();
            self.entry_mut(&mut world, port)?;
            world.drop_port(self.domain, port);
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    fn notify(&self, port: Port) -> HvResult<()> {
        {
            let mut world = self.shared.world.lock();
            let status = self.entry_mut(&mut world, port)?.status;
            if world.take_fault(Fault::Notify) {
                return Err(HvError::provider("notify failed"));
            }
            match status {
                PortStatus::Interdomain {
                    remote,
                    remote_port,
                } => {
                    if let Some(peer) = world.ports.get_mut(&(remote, remote_port)) {
                        peer.pending = true;
                    }
                }
                PortStatus::Unbound { .. } => return Err(HvError::InvalidPort(port)),
                PortStatus::Closed => return Ok(()),
            }
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    fn unmask(&self, port: Port) -> HvResult<()> {
        let pending = {
            let mut world = self.shared.world.lock();
            let entry = self.entry_mut(&mut world, port)?;
            entry.masked = false;
            entry.pending
        };
        if pending {
            self.shared.wake.notify_all();
        }
        Ok(())
    }

    fn is_pending(&self, port: Port) -> HvResult<bool> {
        let mut world = self.shared.world.lock();
        Ok(self.entry_mut(&mut world, port)?.pending)
    }

    fn clear_pending(&self, port: Port) -> HvResult<bool> {
        let mut world = self.shared.world.lock();
        let entry = self.entry_mut(&mut world, port)?;
        Ok(std::mem::replace(&mut entry.pending, false))
    }

    fn wait(&self, port: Port, timeout: Option<Duration>) -> HvResult<WaitOutcome> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut world = self.shared.world.lock();
        loop {
            let entry = self.entry_mut(&mut world, port)?;
            if entry.pending && !entry.masked {
                entry.pending = false;
                entry.masked = true;
                return Ok(WaitOutcome::Notified);
            }
            if entry.status == PortStatus::Closed {
                return Ok(WaitOutcome::Closed);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    self.shared.wake.wait_until(&mut world, deadline);
                }
                None => self.shared.wake.wait(&mut world),
            }
        }
    }

    fn status(&self, port: Port) -> HvResult<PortStatus> {
        let mut world = self.shared.world.lock();
        Ok(self.entry_mut(&mut world, port)?.status)
    }

    fn close(&mut self) -> HvResult<()> {
        if self.closed {
            return Ok(());
        }
        {
            let mut world = self.shared.world.lock();
            let owned: Vec<Port> = world
                .ports
                .iter()
                .filter(|((domain, _), entry)| *domain == self.domain && entry.handle == self.handle)
                .map(|((_, port), _)| *port)
                .collect();
            for port in owned {
                world.drop_port(self.domain, port);
            }
            world.open_handles.remove(&self.handle);
        }
        self.closed = true;
        self.shared.wake.notify_all();
        Ok(())
    }
}

impl Drop for LoopbackEventChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
