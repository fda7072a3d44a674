use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use vchan::{
    ChannelNumber, ConnectionState, DiscoveryFailure, MappingKind, Role, Vchan, VchanError,
    WireVersion,
};
use vchan_hv::{GrantRef, HvError};
use vchan_ring::{RingError, DEBUG_SENTINEL};

use crate::support::{Domains, HookStore, CHANNEL};

#[test]
fn server_write_stream_is_client_read_stream() -> Result<()> {
    let domains = Domains::new();
    let (server, client) = domains.sync_pair(WireVersion::V2)?;

    let (sw, cr) = (server.write_stream()?, client.read_stream()?);
    assert!(std::ptr::eq(sw.producer_cursor(), cr.producer_cursor()));
    assert!(std::ptr::eq(sw.consumer_cursor(), cr.consumer_cursor()));
    assert_eq!(sw.buffer_ptr(), cr.buffer_ptr());

    let (cw, sr) = (client.write_stream()?, server.read_stream()?);
    assert!(std::ptr::eq(cw.producer_cursor(), sr.producer_cursor()));
    assert_eq!(cw.buffer_ptr(), sr.buffer_ptr());
    assert_ne!(sw.buffer_ptr(), cw.buffer_ptr());

    sw.producer_cursor().store(5, Ordering::Release);
    assert_eq!(client.data_ready()?, 5);
    assert_eq!(server.buffer_space()?, sw.capacity() - 5);
    cw.producer_cursor().store(3, Ordering::Release);
    assert_eq!(server.data_ready()?, 3);
    Ok(())
}

#[test]
fn sync_server_connects_exactly_once() -> Result<()> {
    let domains = Domains::new();
    let (mut server, mut client) = domains.sync_pair(WireVersion::V2)?;

    assert_eq!(server.role(), Role::Server);
    assert_eq!(client.role(), Role::Client);
    assert_eq!(server.state(), ConnectionState::Connected);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(!server.handle_connected()?);
    assert_eq!(server.state(), ConnectionState::Connected);

    assert!(!server.is_advertised());
    assert!(domains.rendezvous_paths().is_empty());
    Ok(())
}

#[test]
fn missing_server_fails_discovery_without_blocking() {
    let domains = Domains::new();
    let started = Instant::now();
    let err = Vchan::client_init(&domains.hv.context(domains.client), domains.server, CHANNEL)
        .expect_err("nobody is listening");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(err.is_discovery(), "{err}");
    assert!(matches!(
        err,
        VchanError::Discovery {
            reason: DiscoveryFailure::Missing { .. },
            ..
        }
    ));
    crate::support::assert_nothing_held(domains.hv.stats());
}

#[test]
fn discovery_rejects_unusable_entries() {
    let domains = Domains::new();
    let scope = format!("{}/device/vchan/{}", domains.server.home(), CHANNEL);
    let attempt = || {
        Vchan::client_init(&domains.hv.context(domains.client), domains.server, CHANNEL)
            .expect_err("entries are unusable")
    };

    domains.hv.write_store(&format!("{scope}/version"), "9");
    domains.hv.write_store(&format!("{scope}/ring-ref"), "8");
    domains.hv.write_store(&format!("{scope}/event-channel"), "1");
    assert!(matches!(
        attempt(),
        VchanError::Discovery {
            reason: DiscoveryFailure::UnsupportedVersion(_),
            ..
        }
    ));

    domains.hv.write_store(&format!("{scope}/version"), "2");
    domains.hv.write_store(&format!("{scope}/ring-ref"), "0");
    assert!(matches!(
        attempt(),
        VchanError::Discovery {
            reason: DiscoveryFailure::Zero { key: "ring-ref" },
            ..
        }
    ));

    domains.hv.write_store(&format!("{scope}/ring-ref"), "8");
    domains.hv.write_store(&format!("{scope}/event-channel"), "one");
    assert!(matches!(
        attempt(),
        VchanError::Discovery {
            reason: DiscoveryFailure::Malformed { key: "event-channel", .. },
            ..
        }
    ));
}

#[test]
fn publication_racing_discovery_never_downgrades_the_version() -> Result<()> {
    let domains = Domains::new();
    let server_ctx = domains.hv.context(domains.server);
    let config = domains.config(WireVersion::V2).deferred();
    let published = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&published);

    // The server publishes in between the client's directory reads.
    let mut ctx = domains.hv.context(domains.client);
    ctx.store = Arc::new(HookStore::new(Arc::clone(&ctx.store), move || {
        *slot.lock() = Some(Vchan::server_init(&server_ctx, CHANNEL, &config));
    }));

    let err = Vchan::client_init(&ctx, domains.server, CHANNEL)
        .expect_err("entries read before publication");
    assert!(err.is_discovery(), "unexpected failure: {err}");
    let server = published
        .lock()
        .take()
        .expect("server published during discovery")?;

    let client = Vchan::client_init(&ctx, domains.server, CHANNEL)?;
    assert_eq!(client.version(), WireVersion::V2);
    assert_eq!(client.mapping_kind(), Some(MappingKind::ClientGrant));
    assert_eq!(client.reference(), server.reference());
    Ok(())
}

#[test]
fn stale_entries_without_a_grant_are_a_mapping_failure() {
    let domains = Domains::new();
    let scope = format!("{}/device/vchan/{}", domains.server.home(), CHANNEL);
    domains.hv.write_store(&format!("{scope}/version"), "2");
    domains.hv.write_store(&format!("{scope}/ring-ref"), "77");
    domains.hv.write_store(&format!("{scope}/event-channel"), "3");

    let err = Vchan::client_init(&domains.hv.context(domains.client), domains.server, CHANNEL)
        .expect_err("grant does not exist");
    assert!(!err.is_discovery());
    assert!(matches!(
        err,
        VchanError::Hypervisor(HvError::BadGrant { gref: GrantRef(77), .. })
    ));
}

#[test]
fn absent_version_means_frame_sharing() -> Result<()> {
    let domains = Domains::new();
    let server_ctx = domains.hv.context(domains.server);

    let frame = server_ctx.foreign.alloc_frame()?;
    frame.page.ring().initialize();
    let mut events = server_ctx.events.open()?;
    let port = events.bind_unbound(domains.client)?;

    let scope = format!("{}/device/vchan/{}", domains.server.home(), CHANNEL);
    domains.hv.write_store(&format!("{scope}/ring-ref"), &frame.reference.to_string());
    domains.hv.write_store(&format!("{scope}/event-channel"), &port.to_string());

    let mut client = domains.client()?;
    assert_eq!(client.version(), WireVersion::V1);
    assert_eq!(client.mapping_kind(), Some(MappingKind::ClientRange));
    assert!(events.is_pending(port)?);
    assert_eq!(client.state(), ConnectionState::Connected);
    Ok(())
}

#[test]
fn uninitialised_ring_is_rejected_and_unmapped() -> Result<()> {
    let domains = Domains::new();
    let server_ctx = domains.hv.context(domains.server);

    let page = server_ctx.grants.grant_page(domains.client)?;
    let mut events = server_ctx.events.open()?;
    let port = events.bind_unbound(domains.client)?;
    let scope = format!("{}/device/vchan/{}", domains.server.home(), CHANNEL);
    domains.hv.write_store(&format!("{scope}/version"), "2");
    domains.hv.write_store(&format!("{scope}/ring-ref"), &page.reference.to_string());
    domains.hv.write_store(&format!("{scope}/event-channel"), &port.to_string());

    let err = domains.client().map(|_| ()).expect_err("sentinel is missing");
    let err = err.downcast::<VchanError>()?;
    assert!(matches!(
        err,
        VchanError::CorruptRing(RingError::SentinelMismatch {
            expected: DEBUG_SENTINEL,
            found: 0
        })
    ));
    assert_eq!(domains.hv.stats().mappings, 0);
    assert_eq!(
        domains.releases_by(domains.client),
        vec![vchan_hv::loopback::ReleaseCall::UnmapGrantRef]
    );
    assert!(!events.is_pending(port)?, "client must not signal a corrupt ring");
    Ok(())
}

#[test]
fn channels_between_the_same_domains_are_independent() -> Result<()> {
    let domains = Domains::new();
    let server_ctx = domains.hv.context(domains.server);
    let client_ctx = domains.hv.context(domains.client);
    let config = domains.config(WireVersion::V2).deferred();

    let mut first = Vchan::server_init(&server_ctx, ChannelNumber(1), &config)?;
    let mut second = Vchan::server_init(&server_ctx, ChannelNumber(2), &config)?;
    let _client_two = Vchan::client_init(&client_ctx, domains.server, ChannelNumber(2))?;

    assert!(!first.is_pending()?);
    assert!(second.handle_connected()?);
    assert_eq!(first.state(), ConnectionState::Waiting);
    assert_eq!(second.state(), ConnectionState::Connected);
    assert!(first.is_advertised());
    assert_ne!(first.reference(), second.reference());
    Ok(())
}
