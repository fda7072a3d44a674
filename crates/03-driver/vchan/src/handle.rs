use std::time::Duration;

use tracing::{debug, warn};
use vchan_hv::{DomainId, HvContext, Port, PortStatus, WaitOutcome};
use vchan_ring::{bind_directions, DirectionBinding, RingDescriptor, Role, StreamView};

use crate::config::{ServerConfig, WireVersion};
use crate::endpoint::NotifyEndpoint;
use crate::error::{VchanError, VchanResult};
use crate::mapping::{MappingKind, RingReference};
use crate::rendezvous::{self, ChannelNumber};
use crate::resources::Resources;
use crate::state::{ConnectionState, StateMachine};
use crate::{client, server};

/// One end of an established (or pending) link.
///
/// Dropping the handle tears it down.
#[derive(Debug)]
pub struct Vchan {
    role: Role,
    peer: DomainId,
    channel: ChannelNumber,
    version: WireVersion,
    reference: RingReference,
    binding: DirectionBinding,
    state: StateMachine,
    resources: Resources,
}

impl Vchan {
    /// Publishes a new ring on `channel` for `config.peer`.
    ///
    /// In [`crate::InitMode::Sync`] this blocks until the client signals and
    /// returns a connected handle; in deferred mode it returns a waiting
    /// handle that [`Vchan::handle_connected`] completes.
    pub fn server_init(
        ctx: &HvContext,
        channel: ChannelNumber,
        config: &ServerConfig,
    ) -> VchanResult<Self> {
        server::handshake(ctx, channel, config)
    }

    /// Connects to the ring `peer` published on `channel`.
    pub fn client_init(ctx: &HvContext, peer: DomainId, channel: ChannelNumber) -> VchanResult<Self> {
        client::handshake(ctx, peer, channel)
    }

    /// Takes ownership of a fully acquired resource stack.
    pub(crate) fn assemble(
        role: Role,
        peer: DomainId,
        channel: ChannelNumber,
        reference: RingReference,
        state: StateMachine,
        resources: Resources,
    ) -> Self {
        Self {
            role,
            peer,
            channel,
            version: reference.version(),
            reference,
            binding: bind_directions(role),
            state,
            resources,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> DomainId {
        self.peer
    }

    pub fn channel(&self) -> ChannelNumber {
        self.channel
    }

    pub fn version(&self) -> WireVersion {
        self.version
    }

    pub fn reference(&self) -> RingReference {
        self.reference
    }

    pub fn binding(&self) -> DirectionBinding {
        self.binding
    }

    /// How the ring page is held, or `None` once torn down.
    pub fn mapping_kind(&self) -> Option<MappingKind> {
        self.resources.page().map(|page| page.kind())
    }

    /// Local notification port, or `None` once torn down.
    pub fn local_port(&self) -> Option<Port> {
        self.resources.endpoint().map(|endpoint| endpoint.port())
    }

    /// Whether the rendezvous entries are still published.
    pub fn is_advertised(&self) -> bool {
        self.resources.rendezvous().is_some()
    }

    pub fn is_torn_down(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn ring(&self) -> VchanResult<&RingDescriptor> {
        self.resources
            .page()
            .map(|page| page.ring())
            .ok_or(VchanError::TornDown)
    }

    /// Stream this end produces into.
    pub fn write_stream(&self) -> VchanResult<StreamView<'_>> {
        Ok(self.ring()?.stream(self.binding.write))
    }

    /// Stream this end consumes from.
    pub fn read_stream(&self) -> VchanResult<StreamView<'_>> {
        Ok(self.ring()?.stream(self.binding.read))
    }

    /// Bytes waiting to be read.
    pub fn data_ready(&self) -> VchanResult<usize> {
        Ok(self.read_stream()?.pending() as usize)
    }

    /// Bytes that can be written without overrunning the reader.
    pub fn buffer_space(&self) -> VchanResult<usize> {
        Ok(self.write_stream()?.free())
    }

    /// Signals the peer.
    pub fn notify(&self) -> VchanResult<()> {
        Ok(self.endpoint()?.notify()?)
    }

    /// Whether a signal from the peer is waiting, without consuming it.
    pub fn is_pending(&self) -> VchanResult<bool> {
        Ok(self.endpoint()?.is_pending()?)
    }

    /// Blocks for the next signal (or `timeout`), then re-enables delivery.
    pub fn wait(&self, timeout: Option<Duration>) -> VchanResult<WaitOutcome> {
        let endpoint = self.endpoint()?;
        let outcome = endpoint.wait(timeout)?;
        if outcome == WaitOutcome::Notified {
            endpoint.unmask()?;
        }
        Ok(outcome)
    }

    /// Completes a deferred server handshake once the client has signalled:
    /// consumes the signal, unmasks delivery, removes the rendezvous entries
    /// and moves `Waiting -> Connected`.
    ///
    /// Returns `Ok(false)` when there was nothing to complete.
    pub fn handle_connected(&mut self) -> VchanResult<bool> {
        if self.role != Role::Server || self.state.current() != ConnectionState::Waiting {
            return Ok(false);
        }
        let endpoint = self.endpoint()?;
        endpoint.clear_pending()?;
        endpoint.unmask()?;
        if let Some(channel) = self.resources.rendezvous() {
            let session = self.resources.ctx().store.open()?;
            rendezvous::remove(session.as_ref(), channel)?;
            self.resources.forget_rendezvous();
        }
        Ok(self.state.peer_connected())
    }

    /// Current state, re-probing the peer unless already disconnected.
    pub fn state(&mut self) -> ConnectionState {
        let current = self.state.current();
        if current == ConnectionState::Disconnected {
            return current;
        }
        match self.disconnect_reason(current) {
            Some(reason) => self.state.disconnect(reason),
            None => current,
        }
    }

    fn disconnect_reason(&self, current: ConnectionState) -> Option<&'static str> {
        let (Some(page), Some(endpoint)) = (self.resources.page(), self.resources.endpoint()) else {
            return Some("torn down");
        };
        match self.resources.ctx().domains.is_alive(self.peer) {
            Ok(true) => {}
            Ok(false) => return Some("peer domain gone"),
            Err(err) => warn!(peer = %self.peer, error = %err, "liveness probe failed"),
        }
        if current != ConnectionState::Connected {
            return None;
        }
        if page.ring().any_closed() {
            return Some("ring closed");
        }
        match endpoint.status() {
            Ok(PortStatus::Interdomain { .. }) => None,
            Ok(_) => Some("notification port closed"),
            Err(err) => {
                warn!(error = %err, "port status probe failed");
                None
            }
        }
    }

    /// Releases everything the handle owns. Failures are logged, never
    /// returned. Calling it again does nothing.
    pub fn teardown(&mut self) {
        if self.resources.is_empty() {
            self.state.disconnect("torn down");
            return;
        }
        let failures = self.resources.release_all();
        debug!(role = %self.role, channel = %self.channel, failures, "teardown complete");
        self.state.disconnect("torn down");
    }

    /// Marks this end closed in the ring, signals the peer once, then tears
    /// down.
    pub fn close(mut self) {
        if let Some(page) = self.resources.page() {
            page.ring().mark_closed(self.role);
        }
        if let Ok(endpoint) = self.endpoint() {
            if let Err(err) = endpoint.notify() {
                debug!(error = %err, "close notification not delivered");
            }
        }
        self.teardown();
    }

    fn endpoint(&self) -> VchanResult<&NotifyEndpoint> {
        self.resources.endpoint().ok_or(VchanError::TornDown)
    }
}

impl Drop for Vchan {
    fn drop(&mut self) {
        self.teardown();
    }
}
