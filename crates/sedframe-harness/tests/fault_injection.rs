//! Fault-injection scenarios: the debug layer interposed on live traffic.

use std::{sync::Arc, time::Duration};

use sedframe_core::{
    Credential, FaultBuilder, FaultPoint, SedDevice, SedError, Session, SessionState,
    TestContext, TestSession,
    debug::{config_key, counter, workaround},
    discovery,
    transport::SharedTransport,
};
use sedframe_harness::{DiscoveryFixture, FakeTper, FakeTperConfig};
use sedframe_proto::{
    MethodStatus, ProtocolError, SscKind,
    uid::{cpin, sp},
};

mod common;

fn rig() -> (Arc<FakeTper>, SharedTransport, Arc<TestContext>) {
    common::init_logging();
    let tper = Arc::new(FakeTper::opal20());
    let transport: SharedTransport = tper.clone();
    let ctx = Arc::new(TestContext::new());
    ctx.enable();
    (tper, transport, ctx)
}

/// S3: SP_BUSY injected three times at AfterRecvMethod; with the retry
/// workaround the call succeeds on the fourth send.
#[test]
fn sp_busy_retry_succeeds_after_injections() {
    let (_tper, transport, ctx) = rig();

    let mut session = Session::with_context(Arc::clone(&transport), 0x07FE, Arc::clone(&ctx));
    session.start(sp::ADMIN, false).unwrap();

    let mut ts = TestSession::with_context("sp_busy_retry", Arc::clone(&ctx));
    ts.fault(
        FaultBuilder::new("busy_3x")
            .at(FaultPoint::AfterRecvMethod)
            .return_error(SedError::MethodStatus(MethodStatus::SpBusy))
            .times(3),
    )
    .unwrap();
    ts.workaround(workaround::RETRY_ON_SP_BUSY);
    ts.global_config(config_key::MAX_RETRIES, 5i64);

    let msid =
        sedframe_core::SscAdapter::Opal20.get_cpin(&mut session, cpin::MSID).unwrap();
    assert!(!msid.is_empty());
    assert_eq!(ts.counter(counter::TRANSPORT_SEND), 4, "one initial send plus three retries");
    assert_eq!(ts.counter(counter::METHOD_RETRY), 3);
    assert_eq!(ctx.fault_fired("busy_3x"), Some(3));

    session.close().unwrap();
}

#[test]
fn sp_busy_surfaces_when_retry_budget_runs_out() {
    let (_tper, transport, ctx) = rig();

    let mut session = Session::with_context(Arc::clone(&transport), 0x07FE, Arc::clone(&ctx));
    session.start(sp::ADMIN, false).unwrap();

    let mut ts = TestSession::with_context("budget", Arc::clone(&ctx));
    ts.fault(
        FaultBuilder::new("busy_forever")
            .at(FaultPoint::AfterRecvMethod)
            .return_error(SedError::MethodStatus(MethodStatus::SpBusy))
            .always(),
    )
    .unwrap();
    ts.workaround(workaround::RETRY_ON_SP_BUSY);
    ts.global_config(config_key::MAX_RETRIES, 2i64);

    let err = sedframe_core::SscAdapter::Opal20
        .get_cpin(&mut session, cpin::MSID)
        .unwrap_err();
    assert_eq!(err, SedError::MethodStatus(MethodStatus::SpBusy));
    assert!(err.is_transient());
    assert_eq!(ts.counter(counter::TRANSPORT_SEND), 3, "initial send plus two retries");
}

/// S4: a corrupted SyncSession response fails the start and leaves the
/// session Closed.
#[test]
fn corrupt_sync_session_closes_session() {
    let (_tper, transport, ctx) = rig();

    let ts = TestSession::with_context("corrupt_recv", Arc::clone(&ctx));
    // Offset 56 is the first token byte: header sizes 20 + 24 + 12
    ts.fault(
        FaultBuilder::new("corrupt_sync")
            .at(FaultPoint::AfterIfRecv)
            .corrupt(56, 0xFF)
            .once(),
    )
    .unwrap();

    let mut session = Session::with_context(Arc::clone(&transport), 0x07FE, Arc::clone(&ctx));
    let err = session.start(sp::ADMIN, false).unwrap_err();
    assert!(
        matches!(
            err,
            SedError::MethodMalformed { .. }
                | SedError::Protocol(ProtocolError::TokenInvalidEncoding { .. })
        ),
        "unexpected error kind: {err:?}"
    );
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(ctx.fault_fired("corrupt_sync"), Some(1));
}

/// P6 end to end: a `.times(2)` fault fires on exactly two rounds.
#[test]
fn fault_budget_is_exhausted_in_flight() {
    let (_tper, transport, ctx) = rig();

    let mut session = Session::with_context(Arc::clone(&transport), 0x07FE, Arc::clone(&ctx));
    session.start(sp::ADMIN, false).unwrap();

    let ts = TestSession::with_context("exhaustion", Arc::clone(&ctx));
    ts.fault(FaultBuilder::new("flaky").at(FaultPoint::BeforeIfSend).fail().times(2)).unwrap();

    let adapter = sedframe_core::SscAdapter::Opal20;
    for _ in 0..2 {
        let err = adapter.get_cpin(&mut session, cpin::MSID).unwrap_err();
        assert_eq!(err, SedError::FaultInjected { name: "flaky".into() });
    }
    adapter.get_cpin(&mut session, cpin::MSID).unwrap();
    assert_eq!(ctx.fault_fired("flaky"), Some(2));
}

/// P7: a disabled context with armed faults behaves as if none were armed.
#[test]
fn disabled_context_injects_nothing() {
    common::init_logging();
    let tper = Arc::new(FakeTper::opal20());
    let transport: SharedTransport = tper.clone();
    let ctx = Arc::new(TestContext::new());

    ctx.arm(FaultBuilder::new("armed").at(FaultPoint::BeforeIfSend).fail().always()).unwrap();
    ctx.disable();

    let device = SedDevice::with_context(transport, Arc::clone(&ctx)).unwrap();
    let new_sid = Credential::from_bytes(b"owner".to_vec());
    device.take_ownership(&new_sid).unwrap();
    assert_eq!(tper.sid_pin().unwrap(), b"owner".to_vec());
    assert_eq!(ctx.fault_fired("armed"), Some(0));
}

#[test]
fn replaced_discovery_changes_reported_ssc() {
    let (_tper, transport, ctx) = rig();

    let fake = DiscoveryFixture {
        ssc: SscKind::Pyrite20,
        base_com_id: 0x0001,
        ..DiscoveryFixture::default()
    }
    .build();

    let ts = TestSession::with_context("fake_discovery", Arc::clone(&ctx));
    ts.fault(
        FaultBuilder::new("fake_disc")
            .at(FaultPoint::AfterDiscovery)
            .replace_with(fake)
            .once(),
    )
    .unwrap();

    let info = discovery::discovery0_with(transport.as_ref(), &ctx).unwrap();
    assert_eq!(info.primary_ssc, SscKind::Pyrite20, "injected blob wins");

    let again = discovery::discovery0_with(transport.as_ref(), &ctx).unwrap();
    assert_eq!(again.primary_ssc, SscKind::Opal20, "fault was single-shot");
}

#[test]
fn injected_serial_overrides_drive() {
    let (_tper, transport, ctx) = rig();
    ctx.set_global_config(config_key::INJECT_SERIAL, "FAKE_SN_12345".into());

    let info = discovery::discovery0_with(transport.as_ref(), &ctx).unwrap();
    assert_eq!(info.serial.as_deref(), Some("FAKE_SN_12345"));
}

#[test]
fn callback_fault_observes_every_send() {
    let (_tper, transport, ctx) = rig();
    let sends = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let ts = TestSession::with_context("observe_sends", Arc::clone(&ctx));
    let seen = Arc::clone(&sends);
    ts.fault(
        FaultBuilder::new("log_every_send")
            .at(FaultPoint::BeforeIfSend)
            .callback(move |payload| {
                assert!(!payload.is_empty());
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .always(),
    )
    .unwrap();

    let mut session = Session::with_context(Arc::clone(&transport), 0x07FE, Arc::clone(&ctx));
    session.start(sp::ADMIN, false).unwrap();
    session.close().unwrap();

    let observed = sends.load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(observed as u64, ctx.counter(counter::TRANSPORT_SEND));
    assert!(observed >= 2, "start and close both send");
}

/// Outstanding-data responses make the engine poll until the payload
/// arrives.
#[test]
fn polling_rides_out_stalled_responses() {
    common::init_logging();
    let config = FakeTperConfig { stall_recvs: 2, ..FakeTperConfig::default() };
    let tper = Arc::new(FakeTper::new(config));
    let transport: SharedTransport = tper.clone();
    let ctx = Arc::new(TestContext::new());
    ctx.enable();

    let ts = TestSession::with_context("stall", Arc::clone(&ctx));
    let mut session = Session::with_context(Arc::clone(&transport), 0x07FE, Arc::clone(&ctx));
    session.start(sp::ADMIN, false).unwrap();

    assert_eq!(ts.counter(counter::TRANSPORT_SEND), 1);
    assert_eq!(ts.counter(counter::TRANSPORT_RECV), 3, "two stalls plus the real response");
    session.close().unwrap();
}

#[test]
fn persistent_stall_times_out_within_deadline() {
    common::init_logging();
    let config = FakeTperConfig { stall_recvs: u32::MAX, ..FakeTperConfig::default() };
    let tper = Arc::new(FakeTper::new(config));
    let transport: SharedTransport = tper.clone();

    let mut session =
        Session::with_context(transport, 0x07FE, Arc::new(TestContext::new()));
    session.set_timeout(Duration::from_millis(120));

    let err = session.start(sp::ADMIN, false).unwrap_err();
    assert!(matches!(err, SedError::Timeout { .. }));
    assert!(err.is_transient());
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn trace_records_fired_faults() {
    let (_tper, transport, ctx) = rig();

    let mut ts = TestSession::with_context("tracing", Arc::clone(&ctx));
    ts.retain_trace();
    ts.fault(
        FaultBuilder::new("mark_recv").at(FaultPoint::AfterIfRecv).corrupt(0, 0x00).always(),
    )
    .unwrap();

    let mut session = Session::with_context(Arc::clone(&transport), 0x07FE, Arc::clone(&ctx));
    session.start(sp::ADMIN, false).unwrap();
    session.close().unwrap();

    let trace = ts.trace();
    assert!(!trace.is_empty());
    assert!(trace.iter().all(|e| e.tag == "after_if_recv" && e.detail == "mark_recv"));
    assert!(trace.iter().all(|e| e.outcome.is_none()), "corrupt is a pass-through action");
}

#[test]
fn extended_timeout_workaround_is_read_from_config() {
    let (_tper, transport, ctx) = rig();

    let mut ts = TestSession::with_context("slow_enterprise", Arc::clone(&ctx));
    ts.global_config(config_key::TIMEOUT_EXTEND_MS, 120_000u64);
    ts.workaround(workaround::EXTEND_TIMEOUT);
    assert_eq!(ctx.config_u64(config_key::TIMEOUT_EXTEND_MS, None), Some(120_000));

    // The stalled drive would normally blow a tight deadline; the extended
    // timeout keeps the poll loop alive. Keep the stall short so the test
    // stays fast.
    let config = FakeTperConfig { stall_recvs: 3, ..FakeTperConfig::default() };
    let tper = Arc::new(FakeTper::new(config));
    let transport2: SharedTransport = tper.clone();
    let mut session = Session::with_context(transport2, 0x07FE, Arc::clone(&ctx));
    session.set_timeout(Duration::from_millis(1));
    session.start(sp::ADMIN, false).unwrap();
    session.close().unwrap();
    drop(transport);
}
