//! Session lifecycle state machine.
//!
//! A [`Session`] is the exclusive owner of one host session number against
//! one security provider. It is deliberately not `Clone`: sharing a session
//! across threads would break the strict request/response serialization the
//! TPer requires, so concurrent callers open their own sessions (or use
//! [`crate::pool::SessionPool`]).
//!
//! # State machine
//!
//! ```text
//!             start              sync OK
//!     Closed ───────▶ Opening ──────────▶ Open
//!         ▲              │                 │
//!         └──────────────┴─────────────────┘
//!              failure or close
//! ```
//!
//! Session-manager traffic (Properties, StartSession) travels in Packets
//! with both session numbers zero; only an Open session stamps its TSN/HSN
//! into outbound frames.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use sedframe_proto::{MethodStatus, Uid, compacket::FrameParams, uid::{param, sm, sp, method as method_uid}};

use crate::{
    auth::Credential,
    debug::{TestContext, config_key, counter, workaround},
    error::{Result, SedError},
    exchange,
    method::{self, MethodCall},
    transport::SharedTransport,
};

/// Default deadline for one I/O round before the `extend_timeout`
/// workaround or a per-session override is applied.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum ComPacket size before Properties negotiation.
pub const DEFAULT_MAX_COMPACKET: usize = 2048;

/// Host session numbers are handed out from a process-wide counter, so two
/// live sessions can never collide regardless of which transport they use.
static NEXT_HSN: AtomicU32 = AtomicU32::new(0x1000);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session open; session-manager calls only
    Closed,
    /// StartSession sent, awaiting SyncSession
    Opening,
    /// SyncSession received; in-session methods allowed
    Open,
}

/// Snapshot of a session's identity for evaluation tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Host session number
    pub hsn: u32,
    /// TPer session number (0 unless open)
    pub tsn: u32,
    /// Current lifecycle state
    pub state: SessionState,
    /// Last packet sequence number issued
    pub seq_number: u32,
    /// ComID the session communicates on
    pub com_id: u16,
    /// True if the session was opened read-only
    pub read_only: bool,
}

/// Values returned by a successful StartSession/SyncSession exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSessionResult {
    /// Host session number the session proposed
    pub hsn: u32,
    /// TPer session number assigned by the drive
    pub tsn: u32,
}

/// Optional StartSession parameters.
#[derive(Debug, Clone, Default)]
pub struct StartSessionOpts {
    /// Host challenge (credential proven during StartSession)
    pub challenge: Option<Vec<u8>>,
    /// Host exchange authority
    pub exchange_authority: Option<Uid>,
    /// Host signing authority
    pub signing_authority: Option<Uid>,
    /// Session timeout in milliseconds requested from the TPer
    pub timeout_ms: Option<u64>,
}

/// One authenticated channel to a security provider.
pub struct Session {
    transport: SharedTransport,
    ctx: Arc<TestContext>,
    com_id: u16,
    hsn: u32,
    tsn: u32,
    sp_uid: Option<Uid>,
    state: SessionState,
    retired: bool,
    seq_number: u32,
    read_only: bool,
    max_compacket: usize,
    timeout: Duration,
}

impl Session {
    /// Create a closed session on `com_id`, observing through the global
    /// test context.
    #[must_use]
    pub fn new(transport: SharedTransport, com_id: u16) -> Self {
        Self::with_context(transport, com_id, TestContext::global())
    }

    /// Create a closed session observing through an explicit context.
    #[must_use]
    pub fn with_context(
        transport: SharedTransport,
        com_id: u16,
        ctx: Arc<TestContext>,
    ) -> Self {
        Self {
            transport,
            ctx,
            com_id,
            hsn: NEXT_HSN.fetch_add(1, Ordering::Relaxed),
            tsn: 0,
            sp_uid: None,
            state: SessionState::Closed,
            retired: false,
            seq_number: 0,
            read_only: false,
            max_compacket: DEFAULT_MAX_COMPACKET,
            timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Host session number owned by this session.
    #[must_use]
    pub fn hsn(&self) -> u32 {
        self.hsn
    }

    /// TPer session number; 0 unless the session is open.
    #[must_use]
    pub fn tsn(&self) -> u32 {
        self.tsn
    }

    /// ComID this session communicates on.
    #[must_use]
    pub fn com_id(&self) -> u16 {
        self.com_id
    }

    /// Security provider the session is (or was) open against.
    #[must_use]
    pub fn sp_uid(&self) -> Option<Uid> {
        self.sp_uid
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True while in-session methods may be invoked.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Identity snapshot for evaluation tooling.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            hsn: self.hsn,
            tsn: self.tsn,
            state: self.state,
            seq_number: self.seq_number,
            com_id: self.com_id,
            read_only: self.read_only,
        }
    }

    /// The transport this session shares with its siblings.
    #[must_use]
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// The test context this session observes through.
    #[must_use]
    pub fn context(&self) -> &Arc<TestContext> {
        &self.ctx
    }

    /// Negotiated maximum ComPacket size.
    #[must_use]
    pub fn max_compacket_size(&self) -> usize {
        self.max_compacket
    }

    /// Adopt a negotiated maximum ComPacket size (from Properties).
    pub fn set_max_compacket_size(&mut self, size: usize) {
        self.max_compacket = size.max(512);
    }

    /// Override the per-round I/O deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Deadline for one I/O round: the configured default, extended to
    /// `timeout_extend_ms` when the `extend_timeout` workaround is active.
    #[must_use]
    pub(crate) fn effective_timeout(&self) -> Duration {
        if self.ctx.workaround_active(workaround::EXTEND_TIMEOUT)
            && let Some(ms) = self.ctx.config_u64(config_key::TIMEOUT_EXTEND_MS, None)
        {
            return self.timeout.max(Duration::from_millis(ms));
        }
        self.timeout
    }

    /// Identifiers for the next outbound frame. Sequence numbers increase
    /// strictly within the session, starting at 1 for its first Packet.
    pub(crate) fn frame_params(&mut self) -> FrameParams {
        self.seq_number += 1;
        let (tsn, hsn) = if self.state == SessionState::Open {
            (self.tsn, self.hsn)
        } else {
            (0, 0)
        };
        FrameParams { com_id: self.com_id, tsn, hsn, seq_number: self.seq_number }
    }

    /// Close the session permanently after a fatal transport or desync
    /// error; later invocations fail with [`SedError::SessionClosed`].
    pub(crate) fn mark_fatal(&mut self) {
        if self.state != SessionState::Closed {
            tracing::debug!(hsn = self.hsn, tsn = self.tsn, "session closed by fatal error");
        }
        self.state = SessionState::Closed;
        self.retired = true;
        self.tsn = 0;
    }

    /// Refuse further traffic on a retired session.
    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.retired {
            return Err(SedError::SessionClosed);
        }
        Ok(())
    }

    /// Open a session against `sp` with no authentication (Anybody).
    pub fn start(&mut self, sp: Uid, write: bool) -> Result<StartSessionResult> {
        self.start_opts(sp, write, &StartSessionOpts::default())
    }

    /// Open a session against `sp` with explicit StartSession parameters.
    pub fn start_opts(
        &mut self,
        sp: Uid,
        write: bool,
        opts: &StartSessionOpts,
    ) -> Result<StartSessionResult> {
        self.ensure_usable()?;
        if self.state != SessionState::Closed {
            return Err(SedError::InvalidArgument {
                reason: format!("session {} already started", self.hsn),
            });
        }

        self.state = SessionState::Opening;
        self.sp_uid = Some(sp);
        self.read_only = !write;

        let mut call = MethodCall::new(sm::SMUID, sm::START_SESSION);
        call.uint(u64::from(self.hsn)).uid(sp).boolean(write);
        if let Some(challenge) = &opts.challenge {
            call.named_bytes(param::HOST_CHALLENGE, challenge);
        }
        if let Some(authority) = opts.exchange_authority {
            call.named_uid(param::HOST_EXCHANGE_AUTHORITY, authority);
        }
        if let Some(authority) = opts.signing_authority {
            call.named_uid(param::HOST_SIGNING_AUTHORITY, authority);
        }
        if let Some(ms) = opts.timeout_ms {
            call.named_uint(param::SESSION_TIMEOUT, ms);
        }

        let result = match method::invoke_any_status(self, &call) {
            Ok(r) => r,
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e);
            },
        };

        if !result.status.is_success() {
            self.state = SessionState::Closed;
            tracing::debug!(hsn = self.hsn, status = %result.status, "session start refused");
            return Err(match result.status {
                MethodStatus::SpBusy => SedError::SessionBusy,
                status => SedError::SessionStartFailed { status },
            });
        }

        if result.arg_count() < 2 {
            self.state = SessionState::Closed;
            return Err(SedError::MethodResultShape {
                expected: 2,
                actual: result.arg_count(),
            });
        }
        let echoed_hsn = result.arg_uint(0)?;
        if echoed_hsn != u64::from(self.hsn) {
            self.state = SessionState::Closed;
            return Err(SedError::MethodMalformed {
                reason: "sync session echoed another host session number",
            });
        }
        let tsn = u32::try_from(result.arg_uint(1)?).map_err(|_| {
            SedError::MethodMalformed { reason: "tper session number out of range" }
        })?;

        self.tsn = tsn;
        self.state = SessionState::Open;
        self.ctx.bump(counter::SESSION_OPEN);
        tracing::debug!(hsn = self.hsn, tsn = self.tsn, sp = %sp, "session open");
        Ok(StartSessionResult { hsn: self.hsn, tsn })
    }

    /// Open a session and prove `authority` with `credential` via an
    /// Authenticate call issued right after SyncSession.
    pub fn start_with_auth(
        &mut self,
        sp: Uid,
        write: bool,
        authority: Uid,
        credential: &Credential,
    ) -> Result<StartSessionResult> {
        let started = self.start(sp, write)?;
        if let Err(e) = self.authenticate(authority, credential) {
            // The half-authenticated session is useless; drop it.
            let _ = self.close();
            return Err(e);
        }
        Ok(started)
    }

    /// Prove an authority on the open session.
    pub fn authenticate(&mut self, authority: Uid, credential: &Credential) -> Result<()> {
        if self.state != SessionState::Open {
            return Err(SedError::SessionClosed);
        }
        let mut call = MethodCall::new(sp::THIS_SP, method_uid::AUTHENTICATE);
        call.uid(authority).named_bytes(param::CHALLENGE, credential.as_bytes());
        let result = method::invoke(self, &call)?;
        // The TPer answers a boolean; 0 means the proof was rejected even
        // though the method itself succeeded.
        if result.arg_count() >= 1 && result.arg_uint(0)? == 0 {
            return Err(SedError::MethodStatus(MethodStatus::NotAuthorized));
        }
        tracing::debug!(hsn = self.hsn, authority = %authority, "authenticated");
        Ok(())
    }

    /// Close the session with an EndOfSession token. Per the protocol no
    /// response body is awaited. The session is retired either way.
    pub fn close(&mut self) -> Result<()> {
        if self.state != SessionState::Open {
            self.mark_fatal();
            return Ok(());
        }

        let payload = [0xFA]; // EndOfSession
        let send_result = exchange::send_only(self, &payload);
        let hsn = self.hsn;
        let tsn = self.tsn;
        self.mark_fatal();
        self.ctx.bump(counter::SESSION_CLOSE);
        tracing::debug!(hsn, tsn, "session closed");
        send_result
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("hsn", &self.hsn)
            .field("tsn", &self.tsn)
            .field("com_id", &format!("{:#06x}", self.com_id))
            .field("state", &self.state)
            .field("seq_number", &self.seq_number)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    /// Transport whose device fell off the bus.
    struct DeadTransport;

    impl Transport for DeadTransport {
        fn if_send(&self, _: u8, _: u16, _: &[u8]) -> Result<()> {
            Err(SedError::Transport { reason: "device gone".to_string() })
        }

        fn if_recv(&self, _: u8, _: u16, _: usize) -> Result<Vec<u8>> {
            Err(SedError::Transport { reason: "device gone".to_string() })
        }

        fn is_open(&self) -> bool {
            false
        }
    }

    fn dead_session() -> Session {
        Session::with_context(Arc::new(DeadTransport), 0x07FE, Arc::new(TestContext::new()))
    }

    #[test]
    fn hsn_allocation_is_unique() {
        let a = NEXT_HSN.fetch_add(1, Ordering::Relaxed);
        let b = NEXT_HSN.fetch_add(1, Ordering::Relaxed);
        assert_ne!(a, b);
    }

    #[test]
    fn fresh_session_is_closed_with_zero_tsn() {
        let session = dead_session();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.tsn(), 0);
        assert_eq!(session.info().seq_number, 0);
        assert!(!session.is_open());
    }

    #[test]
    fn transport_failure_during_start_retires_the_session() {
        let mut session = dead_session();
        let err = session.start(sp::ADMIN, false).unwrap_err();
        assert!(matches!(err, SedError::Transport { .. }));
        assert_eq!(session.state(), SessionState::Closed);

        // Retired: even a new start is refused
        assert_eq!(session.start(sp::ADMIN, false), Err(SedError::SessionClosed));
    }

    #[test]
    fn close_is_idempotent_on_a_never_opened_session() {
        let mut session = dead_session();
        assert!(session.close().is_ok());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.ensure_usable(), Err(SedError::SessionClosed));
    }

    #[test]
    fn authenticate_requires_an_open_session() {
        let mut session = dead_session();
        let cred = Credential::plain("pw");
        assert_eq!(
            session.authenticate(sedframe_proto::uid::auth::SID, &cred),
            Err(SedError::SessionClosed)
        );
    }
}
