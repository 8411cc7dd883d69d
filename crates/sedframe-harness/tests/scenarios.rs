//! End-to-end scenarios against the software TPer.
//!
//! Each test builds its own `FakeTper` and `TestContext`, so the suite can
//! run fully parallel with no shared state.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use sedframe_core::{
    Credential, SedDevice, SedError, Session, SessionPool, SessionState, Sha256Hasher,
    TestContext,
    auth::msid_salt,
    discovery, properties,
    transport::SharedTransport,
};
use sedframe_harness::{DiscoveryFixture, FakeTper, FakeTperConfig};
use sedframe_proto::{
    SscKind,
    uid::{auth, sp},
};

mod common;

fn opal_rig() -> (Arc<FakeTper>, SharedTransport, Arc<TestContext>) {
    common::init_logging();
    let tper = Arc::new(FakeTper::opal20());
    let transport: SharedTransport = tper.clone();
    (tper, transport, Arc::new(TestContext::new()))
}

fn active_locking_rig() -> (Arc<FakeTper>, SharedTransport) {
    common::init_logging();
    let tper = Arc::new(FakeTper::new(active_locking_config()));
    let transport: SharedTransport = tper.clone();
    (tper, transport)
}

fn active_locking_config() -> FakeTperConfig {
    FakeTperConfig {
        fixture: DiscoveryFixture { locking_enabled: true, ..DiscoveryFixture::default() },
        locking_activated: true,
        ..FakeTperConfig::default()
    }
}

/// S1: canonical Opal 2.0 discovery blob decodes to the expected features.
#[test]
fn discovery_decode() {
    let (_tper, transport, ctx) = opal_rig();
    let info = discovery::discovery0_with(transport.as_ref(), &ctx).unwrap();

    assert_eq!(info.primary_ssc, SscKind::Opal20);
    assert_eq!(info.base_com_id, 0x07FE);
    assert!(info.locking_present);
    assert!(!info.locking_enabled);
    assert!(info.tper_present);
}

#[test]
fn properties_exchange_reports_tper_limits() {
    let (_tper, transport, ctx) = opal_rig();
    let props = properties::exchange_properties_with(&transport, 0x07FE, &ctx).unwrap();
    assert_eq!(props.max_compacket_size, 2048);
    assert!(props.max_packet_size > 0);
    assert!(!props.raw_properties.is_empty());
}

/// The step-by-step evaluation path: discovery, properties, unauthenticated
/// admin session, MSID read, close. Sequence numbers increase from 1.
#[test]
fn manual_step_by_step() {
    let (tper, transport, ctx) = opal_rig();

    let info = discovery::discovery0_with(transport.as_ref(), &ctx).unwrap();
    let props =
        properties::exchange_properties_with(&transport, info.base_com_id, &ctx).unwrap();

    let mut session =
        Session::with_context(Arc::clone(&transport), info.base_com_id, Arc::clone(&ctx));
    session.set_max_compacket_size(props.max_compacket_size as usize);

    let started = session.start(sp::ADMIN, false).unwrap();
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(started.tsn, session.tsn());
    assert_eq!(session.info().seq_number, 1, "StartSession is the first packet");

    let device_adapter = sedframe_core::SscAdapter::Opal20;
    let msid = device_adapter.get_cpin(&mut session, sedframe_proto::uid::cpin::MSID).unwrap();
    assert_eq!(msid, tper.msid());
    assert_eq!(session.info().seq_number, 2);

    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(tper.session_count(), 0);

    // A closed session refuses further traffic
    let err = device_adapter
        .get_cpin(&mut session, sedframe_proto::uid::cpin::MSID)
        .unwrap_err();
    assert_eq!(err, SedError::SessionClosed);
}

#[test]
fn take_ownership_sets_sid_pin() {
    let (tper, transport, ctx) = opal_rig();
    let device = SedDevice::with_context(transport, ctx).unwrap();

    let new_sid = Credential::from_bytes(b"new-sid-pin".to_vec());
    device.take_ownership(&new_sid).unwrap();
    assert_eq!(tper.sid_pin().unwrap(), b"new-sid-pin".to_vec());

    // The new credential authenticates; the old MSID no longer does
    let mut session = device.open_session(sp::ADMIN, true, Some((auth::SID, &new_sid))).unwrap();
    session.close().unwrap();

    let stale = Credential::from_bytes(tper.msid());
    let err = device.open_session(sp::ADMIN, true, Some((auth::SID, &stale))).unwrap_err();
    assert!(matches!(err, SedError::MethodStatus(_)));
}

/// Credentials derived from a password through the salted hasher behave
/// like any raw credential: the same password re-derives the same bytes,
/// a different password does not.
#[test]
fn hashed_password_credential_round_trips() {
    let (tper, transport, ctx) = opal_rig();
    let device = SedDevice::with_context(transport, ctx).unwrap();

    // Per-drive salt comes from the factory MSID, as the recovery tools do
    let salt = msid_salt(&tper.msid());
    let hasher = Sha256Hasher;
    let owner = Credential::from_password("correct horse battery staple", &hasher, &salt);
    device.take_ownership(&owner).unwrap();
    assert_eq!(tper.sid_pin().unwrap(), owner.as_bytes().to_vec());

    // Re-deriving from the same password and salt authenticates
    let rederived = Credential::from_password("correct horse battery staple", &hasher, &salt);
    let mut session =
        device.open_session(sp::ADMIN, true, Some((auth::SID, &rederived))).unwrap();
    session.close().unwrap();

    // A wrong password hashes to a different credential and is refused
    let wrong = Credential::from_password("correct horse battery stable", &hasher, &salt);
    let err = device.open_session(sp::ADMIN, true, Some((auth::SID, &wrong))).unwrap_err();
    assert!(matches!(err, SedError::MethodStatus(_)));
}

#[test]
fn take_ownership_observer_sees_steps_and_can_abort() {
    let (tper, transport, ctx) = opal_rig();
    let device = SedDevice::with_context(transport, ctx).unwrap();
    let new_sid = Credential::from_bytes(b"unused".to_vec());

    let mut steps = Vec::new();
    let completed = device
        .take_ownership_observed(&new_sid, &mut |step, _raw| {
            steps.push(step.to_string());
            step != "get_msid" // abort once the MSID has been read
        })
        .unwrap();

    assert!(!completed);
    assert_eq!(steps, vec!["start_admin_session", "get_msid"]);
    assert_eq!(tper.sid_pin().unwrap(), tper.msid(), "abort must leave the pin untouched");
}

#[test]
fn activate_then_configure_and_lock_range() {
    let (tper, transport, ctx) = opal_rig();
    let device = SedDevice::with_context(transport, ctx).unwrap();

    let sid = Credential::from_bytes(b"owner".to_vec());
    device.take_ownership(&sid).unwrap();
    device.activate_locking_sp(&sid).unwrap();
    assert!(tper.locking_activated());

    // Admin1 comes up with the MSID credential after activation
    let admin1 = Credential::from_bytes(tper.msid());
    device.enable_user(&admin1, 1).unwrap();
    assert!(tper.user_enabled(1));
    device.configure_range(1, 2048, 4096, &admin1).unwrap();

    let user1 = Credential::from_bytes(tper.msid());
    device.lock_range(1, &user1, 1).unwrap();
    let locked = device.get_range_info(1, &user1, 1).unwrap();
    assert!(locked.read_locked && locked.write_locked);
    assert_eq!(locked.range_start, 2048);
    assert_eq!(locked.range_length, 4096);

    device.unlock_range(1, &user1, 1).unwrap();
    let unlocked = device.get_range_info(1, &user1, 1).unwrap();
    assert!(!unlocked.read_locked && !unlocked.write_locked);
}

#[test]
fn crypto_erase_cycles_the_range_key() {
    let (tper, transport) = active_locking_rig();
    let device = SedDevice::with_context(transport, Arc::new(TestContext::new())).unwrap();

    let admin1 = Credential::from_bytes(tper.msid());
    device.configure_range(2, 0, 8192, &admin1).unwrap();
    assert_eq!(tper.genkey_count(2), 0);
    device.crypto_erase(2, &admin1).unwrap();
    assert_eq!(tper.genkey_count(2), 1);
}

/// S5: two sessions against different SPs coexist on one transport with
/// distinct HSNs.
#[test]
fn dual_session() {
    let (tper, transport) = active_locking_rig();
    let ctx = Arc::new(TestContext::new());
    let device = SedDevice::with_context(Arc::clone(&transport), Arc::clone(&ctx)).unwrap();
    let adapter = device.adapter();

    let sid = Credential::from_bytes(tper.msid());
    let admin1 = Credential::from_bytes(tper.msid());

    let mut session_a = device.open_session(sp::ADMIN, true, Some((auth::SID, &sid))).unwrap();
    let mut session_b =
        device.open_session(sp::LOCKING, true, Some((auth::ADMIN1, &admin1))).unwrap();

    assert_ne!(session_a.hsn(), session_b.hsn());
    assert!(session_a.is_open() && session_b.is_open());
    assert_eq!(tper.session_count(), 2);

    // Interleave: lifecycle over A, locking info over B
    let lifecycle = adapter.get_sp_lifecycle(&mut session_a, sp::LOCKING).unwrap();
    assert_eq!(lifecycle, 9);
    let info = adapter.get_locking_info(&mut session_b, 0).unwrap();
    assert_eq!(info.range_id, 0);

    session_a.close().unwrap();
    session_b.close().unwrap();
    assert_eq!(tper.session_count(), 0);
}

/// S6: a pool of 4 sessions serves 8 workers x 5 jobs without ever handing
/// one session to two workers at once.
#[test]
fn session_pool_serves_workers_exclusively() {
    let (tper, transport) = active_locking_rig();
    let ctx = Arc::new(TestContext::new());

    let admin1 = Credential::from_bytes(tper.msid());
    let pool = SessionPool::open_with(
        &transport,
        0x07FE,
        sp::LOCKING,
        auth::ADMIN1,
        &admin1,
        4,
        &ctx,
    )
    .unwrap();
    assert_eq!(pool.idle(), 4);

    let adapter = sedframe_core::SscAdapter::Opal20;
    let completed = AtomicUsize::new(0);
    let in_use = AtomicUsize::new(0);
    let seen_hsns = Mutex::new(HashSet::new());

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..5 {
                    let mut session = pool.acquire();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    assert!(now <= 4, "more checked-out sessions than the pool holds");

                    seen_hsns.lock().unwrap().insert(session.hsn());
                    adapter.get_locking_info(&mut session, 0).unwrap();

                    in_use.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(completed.load(Ordering::SeqCst), 40);
    assert_eq!(pool.idle(), 4, "all sessions returned");
    assert_eq!(seen_hsns.lock().unwrap().len(), 4, "exactly the pooled sessions served jobs");
}

#[test]
fn enterprise_band_lock_and_erase() {
    common::init_logging();
    let config = FakeTperConfig {
        fixture: DiscoveryFixture {
            ssc: SscKind::Enterprise,
            base_com_id: 0x0801,
            locking_enabled: true,
            ..DiscoveryFixture::default()
        },
        ..FakeTperConfig::default()
    };
    let tper = Arc::new(FakeTper::new(config));
    let transport: SharedTransport = tper.clone();
    let device = SedDevice::with_context(transport, Arc::new(TestContext::new())).unwrap();
    assert_eq!(device.adapter(), sedframe_core::SscAdapter::Enterprise);

    // Enterprise ships with the Locking SP active; BandMaster-style flows
    // authenticate Admin1 directly with the MSID.
    let admin1 = Credential::from_bytes(tper.msid());
    let mut session =
        device.open_session(sp::LOCKING, true, Some((auth::ADMIN1, &admin1))).unwrap();

    device.adapter().lock_band(&mut session, 1).unwrap();
    let info = device.adapter().get_locking_info(&mut session, 1).unwrap();
    assert!(info.read_locked && info.write_locked);

    device.adapter().crypto_erase(&mut session, 1).unwrap();
    let erased = device.adapter().get_locking_info(&mut session, 1).unwrap();
    assert!(!erased.read_locked && !erased.write_locked);

    session.close().unwrap();
}

#[test]
fn pyrite_refuses_ranges_and_erase() {
    common::init_logging();
    let config = FakeTperConfig {
        fixture: DiscoveryFixture { ssc: SscKind::Pyrite20, ..DiscoveryFixture::default() },
        locking_activated: true,
        ..FakeTperConfig::default()
    };
    let tper = Arc::new(FakeTper::new(config));
    let transport: SharedTransport = tper.clone();
    let device = SedDevice::with_context(transport, Arc::new(TestContext::new())).unwrap();
    let adapter = device.adapter();

    let admin1 = Credential::from_bytes(tper.msid());
    let mut session =
        device.open_session(sp::LOCKING, true, Some((auth::ADMIN1, &admin1))).unwrap();

    assert!(matches!(
        adapter.set_range_lock(&mut session, 1, true, true),
        Err(SedError::FeatureUnsupported { .. })
    ));
    assert!(matches!(
        adapter.crypto_erase(&mut session, 0),
        Err(SedError::FeatureUnsupported { .. })
    ));
    // The global range is still lockable
    adapter.set_range_lock(&mut session, 0, true, true).unwrap();
    session.close().unwrap();
}

#[test]
fn revert_requires_confirmation_then_resets() {
    let (tper, transport, ctx) = opal_rig();
    let device = SedDevice::with_context(transport, Arc::clone(&ctx)).unwrap();

    let sid = Credential::from_bytes(b"owner".to_vec());
    device.take_ownership(&sid).unwrap();

    let err = device.revert(&sid, false).unwrap_err();
    assert!(matches!(err, SedError::InvalidArgument { .. }));
    assert_eq!(tper.sid_pin().unwrap(), b"owner".to_vec());

    device.revert(&sid, true).unwrap();
    assert_eq!(tper.sid_pin().unwrap(), tper.msid(), "factory pin restored");
}

#[test]
fn psid_revert_with_printed_credential() {
    let (tper, transport, ctx) = opal_rig();
    let device = SedDevice::with_context(transport, ctx).unwrap();

    let sid = Credential::from_bytes(b"lost-password".to_vec());
    device.take_ownership(&sid).unwrap();

    let wrong = Credential::from_bytes(b"not-the-psid".to_vec());
    assert!(device.psid_revert(&wrong, true).is_err());

    let psid = Credential::from_bytes(tper.psid());
    device.psid_revert(&psid, true).unwrap();
    assert_eq!(tper.sid_pin().unwrap(), tper.msid());
}

#[test]
fn wrong_credential_is_not_authorized() {
    let tper = Arc::new(FakeTper::new(active_locking_config()));
    let transport: SharedTransport = tper.clone();
    let device = SedDevice::with_context(transport, Arc::new(TestContext::new())).unwrap();

    let bad = Credential::from_bytes(b"wrong".to_vec());
    let err = device.open_session(sp::LOCKING, true, Some((auth::ADMIN1, &bad))).unwrap_err();
    assert!(matches!(err, SedError::MethodStatus(_)));
    assert_eq!(tper.session_count(), 0, "failed auth closes the half-open session");
}

#[test]
fn seeded_drives_differ_deterministically() {
    let a1 = FakeTper::with_seed(7);
    let a2 = FakeTper::with_seed(7);
    let b = FakeTper::with_seed(8);
    assert_eq!(a1.msid(), a2.msid());
    assert_ne!(a1.msid(), b.msid());
}
