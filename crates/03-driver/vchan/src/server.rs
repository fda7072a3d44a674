use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use vchan_hv::{DomainId, HvContext, WaitOutcome};
use vchan_ring::Role;

use crate::config::{InitMode, ServerConfig};
use crate::endpoint::NotifyEndpoint;
use crate::error::{VchanError, VchanResult};
use crate::handle::Vchan;
use crate::mapping::RingMapping;
use crate::rendezvous::{self, ChannelNumber, Offer};
use crate::resources::{Resource, Resources};
use crate::state::StateMachine;

/// Allocates the ring, offers a port, publishes both under `channel` and, in
/// sync mode, waits for the client's first signal.
#[instrument(level = "debug", skip(ctx, config), fields(domain = %ctx.domain(), peer = %config.peer))]
pub(crate) fn handshake(
    ctx: &HvContext,
    channel: ChannelNumber,
    config: &ServerConfig,
) -> VchanResult<Vchan> {
    let peer = config.peer;
    let mut resources = Resources::new(ctx.clone());

    let mapping = RingMapping::allocate(ctx, config.version, peer)?;
    mapping.ring().initialize();
    let reference = mapping.reference();
    resources.push(Resource::Page(mapping));

    let endpoint = NotifyEndpoint::offer(ctx, peer)?;
    let port = endpoint.port();
    resources.push(Resource::Endpoint(endpoint));

    let session = ctx.store.open()?;
    // Recorded before the first write so a partial publish is still removed.
    resources.push(Resource::Rendezvous(channel));
    rendezvous::publish(session.as_ref(), channel, &Offer { reference, port })?;

    let mut state = StateMachine::waiting();
    if config.mode == InitMode::Sync {
        if let Some(endpoint) = resources.endpoint() {
            wait_for_peer(ctx, endpoint, peer, config.liveness_poll())?;
            endpoint.unmask()?;
        }
        match rendezvous::remove(session.as_ref(), channel) {
            Ok(()) => resources.forget_rendezvous(),
            Err(err) => warn!(error = %err, "rendezvous cleanup failed; retried at teardown"),
        }
        state.peer_connected();
    }
    drop(session);

    info!(%channel, %reference, %port, state = %state.current(), "server ready");
    Ok(Vchan::assemble(
        Role::Server,
        peer,
        channel,
        reference,
        state,
        resources,
    ))
}

/// Blocks until the peer signals. Waits in `poll` slices and gives up once
/// the peer domain no longer exists.
fn wait_for_peer(
    ctx: &HvContext,
    endpoint: &NotifyEndpoint,
    peer: DomainId,
    poll: Duration,
) -> VchanResult<()> {
    loop {
        match endpoint.wait(Some(poll))? {
            WaitOutcome::Notified => return Ok(()),
            WaitOutcome::Closed => return Err(VchanError::PeerGone(peer)),
            WaitOutcome::TimedOut => {
                if !ctx.domains.is_alive(peer)? {
                    warn!(%peer, "peer vanished while waiting for it to connect");
                    return Err(VchanError::PeerGone(peer));
                }
                debug!(%peer, "still waiting for peer");
            }
        }
    }
}
