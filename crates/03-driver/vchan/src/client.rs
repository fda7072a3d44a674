use tracing::{info, instrument};
use vchan_hv::{DomainId, HvContext};
use vchan_ring::Role;

use crate::endpoint::NotifyEndpoint;
use crate::error::VchanResult;
use crate::handle::Vchan;
use crate::mapping::RingMapping;
use crate::rendezvous::{self, ChannelNumber};
use crate::resources::{Resource, Resources};
use crate::state::StateMachine;

/// Discovers `peer`'s offer on `channel`, maps the ring, binds the port and
/// signals the server.
#[instrument(level = "debug", skip(ctx), fields(domain = %ctx.domain()))]
pub(crate) fn handshake(ctx: &HvContext, peer: DomainId, channel: ChannelNumber) -> VchanResult<Vchan> {
    let offer = {
        let session = ctx.store.open()?;
        rendezvous::discover(session.as_ref(), peer, channel)?
    };

    let mut resources = Resources::new(ctx.clone());

    let mapping = RingMapping::map(ctx, peer, offer.reference)?;
    let checked = mapping.ring().validate();
    resources.push(Resource::Page(mapping));
    checked?;

    let endpoint = NotifyEndpoint::connect(ctx, peer, offer.port)?;
    let notified = endpoint.notify();
    let port = endpoint.port();
    resources.push(Resource::Endpoint(endpoint));
    notified?;

    info!(%peer, %channel, version = %offer.version(), %port, "client connected");
    Ok(Vchan::assemble(
        Role::Client,
        peer,
        channel,
        offer.reference,
        StateMachine::connected(),
        resources,
    ))
}
