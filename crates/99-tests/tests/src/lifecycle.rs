use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use vchan::{ConnectionState, Direction, MappingKind, Role, Vchan, VchanError, WireVersion};
use vchan_hv::loopback::ReleaseCall;
use vchan_hv::WaitOutcome;
use vchan_ring::DEBUG_SENTINEL;

use crate::support::{assert_nothing_held, Domains, CHANNEL};

#[test]
fn fresh_ring_is_zeroed_and_stamped() -> Result<()> {
    let domains = Domains::new();
    let server = domains.deferred_server(WireVersion::V2)?;
    let ring = server.ring()?;
    for direction in [Direction::ToClient, Direction::ToServer] {
        let stream = ring.stream(direction);
        assert_eq!(stream.producer(), 0);
        assert_eq!(stream.consumer(), 0);
    }
    assert!(!ring.is_closed(Role::Server));
    assert!(!ring.is_closed(Role::Client));
    assert_eq!(ring.sentinel(), DEBUG_SENTINEL);
    Ok(())
}

#[test]
fn each_version_pairs_with_its_release_call() -> Result<()> {
    for (version, server_kind, client_kind, server_call, client_call) in [
        (
            WireVersion::V1,
            MappingKind::ServerFrame,
            MappingKind::ClientRange,
            ReleaseCall::FreeFrame,
            ReleaseCall::UnmapForeignRange,
        ),
        (
            WireVersion::V2,
            MappingKind::ServerGrant,
            MappingKind::ClientGrant,
            ReleaseCall::RevokeGrant,
            ReleaseCall::UnmapGrantRef,
        ),
    ] {
        let domains = Domains::new();
        let (server, client) = domains.sync_pair(version)?;
        assert_eq!(server.version(), version);
        assert_eq!(client.version(), version);
        assert_eq!(server.mapping_kind(), Some(server_kind));
        assert_eq!(client.mapping_kind(), Some(client_kind));

        client.close();
        server.close();
        assert_eq!(domains.releases_by(domains.client), vec![client_call]);
        assert_eq!(domains.releases_by(domains.server), vec![server_call]);
        assert_nothing_held(domains.hv.stats());
    }
    Ok(())
}

#[test]
fn teardown_twice_releases_once() -> Result<()> {
    let domains = Domains::new();
    let (mut server, mut client) = domains.sync_pair(WireVersion::V2)?;

    client.teardown();
    client.teardown();
    server.teardown();
    server.teardown();
    drop(client);
    drop(server);

    assert_eq!(domains.hv.release_log().len(), 2);
    assert_nothing_held(domains.hv.stats());
    Ok(())
}

#[test]
fn teardown_removes_an_outstanding_rendezvous() -> Result<()> {
    let domains = Domains::new();
    let server = domains.deferred_server(WireVersion::V1)?;
    assert_eq!(domains.rendezvous_paths().len(), 3);
    drop(server);
    assert!(domains.rendezvous_paths().is_empty());
    assert_nothing_held(domains.hv.stats());
    Ok(())
}

#[test]
fn waiting_server_notices_its_peer_vanish() -> Result<()> {
    let domains = Domains::new();
    let mut server = domains.deferred_server(WireVersion::V2)?;
    assert_eq!(server.state(), ConnectionState::Waiting);

    domains.hv.destroy_domain(domains.client);
    assert_eq!(server.state(), ConnectionState::Disconnected);
    assert!(!server.handle_connected()?);
    assert_eq!(server.state(), ConnectionState::Disconnected);
    Ok(())
}

#[test]
fn sync_server_gives_up_on_a_vanished_peer() {
    let domains = Domains::new();
    let ctx = domains.hv.context(domains.server);
    let config = domains.config(WireVersion::V2);

    let killer = {
        let hv = domains.hv.clone();
        let client = domains.client;
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            hv.destroy_domain(client);
        })
    };
    let outcome = Vchan::server_init(&ctx, CHANNEL, &config);
    killer.join().unwrap();

    assert!(matches!(outcome, Err(VchanError::PeerGone(peer)) if peer == domains.client));
    assert!(domains.rendezvous_paths().is_empty());
    assert_nothing_held(domains.hv.stats());
}

#[test]
fn closing_one_end_disconnects_the_other() -> Result<()> {
    let domains = Domains::new();
    let (mut server, client) = domains.sync_pair(WireVersion::V2)?;

    client.close();
    assert!(server.ring()?.is_closed(Role::Client));
    assert_eq!(server.state(), ConnectionState::Disconnected);
    Ok(())
}

#[test]
fn server_teardown_disconnects_the_client() -> Result<()> {
    let domains = Domains::new();
    let (mut server, mut client) = domains.sync_pair(WireVersion::V1)?;

    server.teardown();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.wait(Some(Duration::from_millis(10)))?, WaitOutcome::Closed);
    Ok(())
}

#[test]
fn destroyed_client_domain_disconnects_the_server() -> Result<()> {
    let domains = Domains::new();
    let (mut server, client) = domains.sync_pair(WireVersion::V2)?;

    domains.hv.destroy_domain(domains.client);
    assert_eq!(server.state(), ConnectionState::Disconnected);
    drop(client);
    Ok(())
}

#[test]
fn notifications_flow_both_ways() -> Result<()> {
    let domains = Domains::new();
    let (server, client) = domains.sync_pair(WireVersion::V2)?;

    let writer = thread::spawn(move || -> Result<Vchan> {
        client
            .write_stream()?
            .producer_cursor()
            .store(4, Ordering::Release);
        client.notify()?;
        Ok(client)
    });
    assert_eq!(server.wait(Some(Duration::from_secs(5)))?, WaitOutcome::Notified);
    assert_eq!(server.data_ready()?, 4);
    let client = writer.join().unwrap()?;

    server.notify()?;
    assert!(client.is_pending()?);
    assert_eq!(client.wait(None)?, WaitOutcome::Notified);
    assert!(!client.is_pending()?);
    Ok(())
}
