//! Partial handshakes must give back everything they acquired.

use anyhow::Result;
use vchan::{ConnectionState, Vchan, VchanError, WireVersion};
use vchan_hv::loopback::Fault;

use crate::support::{assert_nothing_held, Domains, CHANNEL};

#[test]
fn failed_server_handshake_leaves_nothing_behind() {
    for (version, fault) in [
        (WireVersion::V2, Fault::GrantPage),
        (WireVersion::V1, Fault::AllocFrame),
        (WireVersion::V2, Fault::OpenEventChannel),
        (WireVersion::V1, Fault::BindUnbound),
        (WireVersion::V2, Fault::OpenDirectory),
        (WireVersion::V2, Fault::DirectoryWrite("version")),
        (WireVersion::V1, Fault::DirectoryWrite("ring-ref")),
        (WireVersion::V2, Fault::DirectoryWrite("event-channel")),
    ] {
        let domains = Domains::new();
        domains.hv.inject(fault);
        let outcome = Vchan::server_init(
            &domains.hv.context(domains.server),
            CHANNEL,
            &domains.config(version).deferred(),
        );
        assert!(
            matches!(outcome, Err(VchanError::Hypervisor(_))),
            "{fault:?} should surface as a hypervisor error"
        );
        assert!(domains.rendezvous_paths().is_empty(), "{fault:?} left entries");
        assert_nothing_held(domains.hv.stats());
    }
}

#[test]
fn failed_client_handshake_leaves_the_server_untouched() -> Result<()> {
    for (version, fault) in [
        (WireVersion::V2, Fault::OpenDirectory),
        (WireVersion::V2, Fault::MapGrantRef),
        (WireVersion::V1, Fault::MapForeignRange),
        (WireVersion::V2, Fault::OpenEventChannel),
        (WireVersion::V1, Fault::BindInterdomain),
        (WireVersion::V2, Fault::Notify),
    ] {
        let domains = Domains::new();
        let mut server = domains.deferred_server(version)?;
        let before = domains.hv.stats();

        domains.hv.inject(fault);
        let err = domains.client().map(|_| ()).expect_err("fault injected");
        let err = err.downcast::<VchanError>()?;
        assert!(!err.is_discovery(), "{fault:?}: {err}");

        assert_eq!(domains.hv.stats(), before, "{fault:?} leaked client resources");
        assert!(domains.releases_by(domains.server).is_empty());
        assert!(server.is_advertised());
        assert!(!server.is_pending()?, "{fault:?}");
        assert_eq!(server.state(), ConnectionState::Waiting);
    }
    Ok(())
}

#[test]
fn rendezvous_left_by_a_failed_cleanup_goes_at_teardown() -> Result<()> {
    let domains = Domains::new();
    domains.hv.inject(Fault::DirectoryRemove);
    let (mut server, _client) = domains.sync_pair(WireVersion::V2)?;

    assert_eq!(server.state(), ConnectionState::Connected);
    assert!(server.is_advertised());
    assert_eq!(domains.rendezvous_paths().len(), 3);

    server.teardown();
    assert!(!server.is_advertised());
    assert!(domains.rendezvous_paths().is_empty());
    Ok(())
}

#[test]
fn teardown_keeps_going_past_failures() -> Result<()> {
    let domains = Domains::new();
    let (mut server, client) = domains.sync_pair(WireVersion::V2)?;

    // Destroying the client domain reclaims its ports and mapping, so every
    // release the client attempts afterwards fails.
    domains.hv.destroy_domain(domains.client);
    drop(client);
    assert!(domains.releases_by(domains.client).is_empty());

    server.teardown();
    assert!(server.is_torn_down());
    assert_nothing_held(domains.hv.stats());
    Ok(())
}
