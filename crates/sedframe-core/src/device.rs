//! Device handle tying a transport, its discovery and an SSC adapter.
//!
//! [`SedDevice`] composes the multi-session recipes that the thin CLI
//! tools and evaluation rigs call: take ownership, activate the Locking
//! SP, lock/unlock ranges, revert. Each recipe opens the sessions it
//! needs and closes them before returning; the handle itself holds no
//! session state and can be shared behind `&self` across threads.

use std::sync::Arc;

use sedframe_proto::{
    DiscoveryInfo, Uid,
    uid::{auth, cpin, sp},
};

use crate::{
    auth::Credential,
    debug::{TestContext, config_key, workaround},
    discovery,
    error::{Result, SedError},
    method::RawResult,
    session::Session,
    ssc::{LockingRangeInfo, SscAdapter},
    transport::SharedTransport,
};

/// Callback invoked after each step of an observed recipe. Return `false`
/// to abort the recipe after the current step.
pub type StepObserver<'a> = dyn FnMut(&str, &RawResult) -> bool + 'a;

/// One SED drive: shared transport, parsed discovery, chosen adapter.
pub struct SedDevice {
    transport: SharedTransport,
    ctx: Arc<TestContext>,
    info: DiscoveryInfo,
    adapter: SscAdapter,
    com_id: u16,
}

impl SedDevice {
    /// Run discovery on `transport` and build a handle for the drive's
    /// primary SSC, observing through the global test context.
    pub fn new(transport: SharedTransport) -> Result<Self> {
        Self::with_context(transport, TestContext::global())
    }

    /// [`SedDevice::new`] against an explicit test context.
    pub fn with_context(transport: SharedTransport, ctx: Arc<TestContext>) -> Result<Self> {
        let info = discovery::discovery0_with(transport.as_ref(), &ctx)?;
        let adapter = SscAdapter::for_discovery(&info)?;
        let com_id = info.base_com_id;
        if com_id == 0 {
            return Err(SedError::FeatureUnsupported { feature: "no base ComID reported" });
        }
        Ok(Self { transport, ctx, info, adapter, com_id })
    }

    /// Parsed Level 0 Discovery for this drive.
    #[must_use]
    pub fn discovery(&self) -> &DiscoveryInfo {
        &self.info
    }

    /// The adapter chosen from discovery.
    #[must_use]
    pub fn adapter(&self) -> SscAdapter {
        self.adapter
    }

    /// ComID used for all sessions on this handle.
    #[must_use]
    pub fn com_id(&self) -> u16 {
        self.com_id
    }

    /// The shared transport.
    #[must_use]
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Open a session against `sp_uid`, optionally authenticating.
    pub fn open_session(
        &self,
        sp_uid: Uid,
        write: bool,
        authority: Option<(Uid, &Credential)>,
    ) -> Result<Session> {
        let mut session = Session::with_context(
            Arc::clone(&self.transport),
            self.com_id,
            Arc::clone(&self.ctx),
        );
        match authority {
            Some((authority, credential)) => {
                session.start_with_auth(sp_uid, write, authority, credential)?;
            },
            None => {
                session.start(sp_uid, write)?;
            },
        }
        Ok(session)
    }

    /// Read the factory MSID credential (no authentication required).
    pub fn read_msid(&self) -> Result<Vec<u8>> {
        let mut session = self.open_session(sp::ADMIN, false, None)?;
        let msid = self.adapter.get_cpin(&mut session, cpin::MSID);
        session.close()?;
        msid
    }

    /// Take ownership: read the MSID, authenticate as SID with it, set the
    /// SID PIN to `new_sid`.
    pub fn take_ownership(&self, new_sid: &Credential) -> Result<()> {
        let completed = self.take_ownership_observed(new_sid, &mut |_, _| true)?;
        debug_assert!(completed, "unconditional observer cannot abort");
        Ok(())
    }

    /// [`SedDevice::take_ownership`] with a per-step observer.
    ///
    /// The observer sees each step's name and the raw bytes of its method
    /// round (empty for session open/close steps). Returns `Ok(false)` when
    /// the observer aborted the recipe.
    pub fn take_ownership_observed(
        &self,
        new_sid: &Credential,
        observer: &mut StepObserver<'_>,
    ) -> Result<bool> {
        let none = RawResult::empty();

        let mut session = self.open_session(sp::ADMIN, false, None)?;
        if !observer("start_admin_session", &none) {
            session.close()?;
            return Ok(false);
        }

        let msid = match self.adapter.get_cpin(&mut session, cpin::MSID) {
            Ok(m) => m,
            Err(e) => {
                let _ = session.close();
                return Err(e);
            },
        };
        if !observer("get_msid", &none) {
            session.close()?;
            return Ok(false);
        }
        session.close()?;
        if !observer("close_session", &none) {
            return Ok(false);
        }

        let msid_cred = Credential::from_bytes(msid);
        let mut session = self.open_session(sp::ADMIN, true, Some((auth::SID, &msid_cred)))?;
        if !observer("start_sid_session", &none) {
            session.close()?;
            return Ok(false);
        }

        let set = self.adapter.set_cpin(&mut session, cpin::SID, new_sid);
        let raw = match &set {
            Ok(()) => none.clone(),
            Err(e) => RawResult {
                error: Some(e.clone()),
                ..RawResult::empty()
            },
        };
        if let Err(e) = set {
            let _ = session.close();
            return Err(e);
        }
        if !observer("set_sid_pin", &raw) {
            session.close()?;
            return Ok(false);
        }

        session.close()?;
        observer("close_sid_session", &none);
        tracing::debug!("ownership taken");
        Ok(true)
    }

    /// Activate the Locking SP, authenticating as SID.
    pub fn activate_locking_sp(&self, sid: &Credential) -> Result<()> {
        if !self.info.locking_present {
            return Err(SedError::FeatureUnsupported { feature: "locking" });
        }
        let mut session = self.open_session(sp::ADMIN, true, Some((auth::SID, sid)))?;
        let result = self.adapter.activate(&mut session, sp::LOCKING);
        session.close()?;
        result
    }

    /// Lock a range for both reads and writes as Locking SP user `user_n`.
    pub fn lock_range(&self, range: u32, credential: &Credential, user_n: u32) -> Result<()> {
        self.set_range_lock(range, credential, user_n, true, true)
    }

    /// Unlock a range as Locking SP user `user_n`.
    pub fn unlock_range(&self, range: u32, credential: &Credential, user_n: u32) -> Result<()> {
        self.set_range_lock(range, credential, user_n, false, false)
    }

    fn set_range_lock(
        &self,
        range: u32,
        credential: &Credential,
        user_n: u32,
        read_locked: bool,
        write_locked: bool,
    ) -> Result<()> {
        let mut session =
            self.open_session(sp::LOCKING, true, Some((auth::user(user_n), credential)))?;
        let result =
            self.adapter.set_range_lock(&mut session, range, read_locked, write_locked);
        session.close()?;
        result
    }

    /// Read a range's locking state as Locking SP user `user_n`.
    pub fn get_range_info(
        &self,
        range: u32,
        credential: &Credential,
        user_n: u32,
    ) -> Result<LockingRangeInfo> {
        let mut session =
            self.open_session(sp::LOCKING, false, Some((auth::user(user_n), credential)))?;
        let result = self.adapter.get_locking_info(&mut session, range);
        session.close()?;
        result
    }

    /// Configure a range's geometry and enable its locks, as Admin1.
    pub fn configure_range(
        &self,
        range: u32,
        start: u64,
        length: u64,
        admin1: &Credential,
    ) -> Result<()> {
        let mut session =
            self.open_session(sp::LOCKING, true, Some((auth::ADMIN1, admin1)))?;
        let result = self.adapter.configure_range(&mut session, range, start, length);
        session.close()?;
        result
    }

    /// Enable Locking SP user `user_n`, as Admin1.
    pub fn enable_user(&self, admin1: &Credential, user_n: u32) -> Result<()> {
        let mut session =
            self.open_session(sp::LOCKING, true, Some((auth::ADMIN1, admin1)))?;
        let result = self.adapter.enable_user(&mut session, user_n);
        session.close()?;
        result
    }

    /// Set Locking SP user `user_n`'s credential, authenticating as Admin1.
    pub fn set_user_password(
        &self,
        admin1: &Credential,
        user_n: u32,
        new_credential: &Credential,
    ) -> Result<()> {
        let mut session =
            self.open_session(sp::LOCKING, true, Some((auth::ADMIN1, admin1)))?;
        let result = self.adapter.set_cpin(&mut session, cpin::user(user_n), new_credential);
        session.close()?;
        result
    }

    /// Crypto-erase a range, as Admin1.
    pub fn crypto_erase(&self, range: u32, admin1: &Credential) -> Result<()> {
        let mut session =
            self.open_session(sp::LOCKING, true, Some((auth::ADMIN1, admin1)))?;
        let result = self.adapter.crypto_erase(&mut session, range);
        session.close()?;
        result
    }

    /// Revert the TPer to factory state, authenticating as SID.
    ///
    /// Destructive: requires `confirmed` unless the `skip_revert_confirm`
    /// flag is set. The session dies with the revert, so no close is sent.
    pub fn revert(&self, sid: &Credential, confirmed: bool) -> Result<()> {
        self.ensure_revert_confirmed(confirmed)?;
        let mut session = self.open_session(sp::ADMIN, true, Some((auth::SID, sid)))?;
        self.adapter.revert_sp(&mut session, sp::ADMIN)
    }

    /// Revert the TPer with the physical-presence PSID credential.
    pub fn psid_revert(&self, psid: &Credential, confirmed: bool) -> Result<()> {
        self.ensure_revert_confirmed(confirmed)?;
        let mut session = self.open_session(sp::ADMIN, true, Some((auth::PSID, psid)))?;
        self.adapter.revert_sp(&mut session, sp::ADMIN)
    }

    fn ensure_revert_confirmed(&self, confirmed: bool) -> Result<()> {
        let skip = self.ctx.workaround_active(workaround::SKIP_REVERT_CONFIRM)
            || self.ctx.config_bool(config_key::SKIP_REVERT_CONFIRM, None).unwrap_or(false);
        if confirmed || skip {
            Ok(())
        } else {
            Err(SedError::InvalidArgument {
                reason: "revert requires confirmation".to_string(),
            })
        }
    }

    /// Lifecycle state of an SP, read over an unauthenticated Admin SP
    /// session.
    pub fn sp_lifecycle(&self, sp_uid: Uid) -> Result<u8> {
        let mut session = self.open_session(sp::ADMIN, false, None)?;
        let result = self.adapter.get_sp_lifecycle(&mut session, sp_uid);
        session.close()?;
        result
    }
}

impl std::fmt::Debug for SedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SedDevice")
            .field("ssc", &self.info.primary_ssc)
            .field("com_id", &format!("{:#06x}", self.com_id))
            .finish_non_exhaustive()
    }
}
