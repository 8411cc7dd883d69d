//! SSC adapters: per-class dispatch from intents to method invocations.
//!
//! An [`SscAdapter`] is a tagged variant per security subsystem class;
//! everything dispatches by match, and the adapters own no state. Ops here
//! work on an already-open [`Session`]; the multi-session recipes
//! (take-ownership, revert) live on [`crate::device::SedDevice`].

use sedframe_proto::{
    DiscoveryInfo, SscKind, Token, Uid,
    uid::{col, locking, method as method_uid, param},
};

use crate::{
    error::{Result, SedError},
    method::{self, MethodCall},
    session::Session,
};

/// Locking range state as read from the Locking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockingRangeInfo {
    /// Range id (0 = global range)
    pub range_id: u32,
    /// First LBA of the range
    pub range_start: u64,
    /// Length of the range in LBAs
    pub range_length: u64,
    /// Read locking enabled for the range
    pub read_lock_enabled: bool,
    /// Write locking enabled for the range
    pub write_lock_enabled: bool,
    /// Range currently read-locked
    pub read_locked: bool,
    /// Range currently write-locked
    pub write_locked: bool,
}

/// Read a contiguous column span from an object. Shared shape of every
/// `Get` the adapters issue.
pub fn get_columns(
    session: &mut Session,
    object: Uid,
    first: u64,
    last: u64,
) -> Result<Vec<(u64, Token)>> {
    let mut call = MethodCall::new(object, method_uid::GET);
    call.begin_list()
        .named_uint(param::START_COLUMN, first)
        .named_uint(param::END_COLUMN, last)
        .end_list();
    method::invoke(session, &call)?.named_values()
}

/// Write columns of an object via `Set(Values = [...])`.
pub fn set_columns(session: &mut Session, object: Uid, values: &[(u64, Token)]) -> Result<()> {
    let mut call = MethodCall::new(object, method_uid::SET);
    call.begin_name(param::VALUES).begin_list();
    for (column, value) in values {
        call.named(*column, value.clone());
    }
    call.end_list().end_name();
    method::invoke(session, &call)?;
    Ok(())
}

fn named_u64(values: &[(u64, Token)], column: u64) -> Option<u64> {
    values.iter().find(|(c, _)| *c == column).and_then(|(_, v)| v.as_uint())
}

fn named_flag(values: &[(u64, Token)], column: u64) -> bool {
    named_u64(values, column).unwrap_or(0) != 0
}

/// Dispatcher for one security subsystem class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SscAdapter {
    /// Opal SSC 1.0
    Opal10,
    /// Opal SSC 2.0
    Opal20,
    /// Enterprise SSC
    Enterprise,
    /// Pyrite SSC 1.0
    Pyrite10,
    /// Pyrite SSC 2.0
    Pyrite20,
}

impl SscAdapter {
    /// Pick the adapter for a drive's primary SSC.
    pub fn for_discovery(info: &DiscoveryInfo) -> Result<Self> {
        match info.primary_ssc {
            SscKind::Opal10 => Ok(Self::Opal10),
            SscKind::Opal20 => Ok(Self::Opal20),
            SscKind::Enterprise => Ok(Self::Enterprise),
            SscKind::Pyrite10 => Ok(Self::Pyrite10),
            SscKind::Pyrite20 => Ok(Self::Pyrite20),
            SscKind::Unknown => {
                Err(SedError::FeatureUnsupported { feature: "no supported SSC descriptor" })
            },
        }
    }

    /// The SSC this adapter drives.
    #[must_use]
    pub fn kind(self) -> SscKind {
        match self {
            Self::Opal10 => SscKind::Opal10,
            Self::Opal20 => SscKind::Opal20,
            Self::Enterprise => SscKind::Enterprise,
            Self::Pyrite10 => SscKind::Pyrite10,
            Self::Pyrite20 => SscKind::Pyrite20,
        }
    }

    /// Whether the class supports non-global locking ranges (bands).
    #[must_use]
    pub fn supports_ranges(self) -> bool {
        match self {
            Self::Opal10 | Self::Opal20 | Self::Enterprise => true,
            Self::Pyrite10 | Self::Pyrite20 => false,
        }
    }

    /// Whether the class encrypts media (and can therefore crypto-erase).
    #[must_use]
    pub fn supports_crypto_erase(self) -> bool {
        !matches!(self, Self::Pyrite10 | Self::Pyrite20)
    }

    /// Whether the Locking SP needs explicit activation. Enterprise drives
    /// ship with it manufactured active.
    #[must_use]
    pub fn requires_activation(self) -> bool {
        !matches!(self, Self::Enterprise)
    }

    fn range_uid(self, range: u32) -> Result<Uid> {
        if range != 0 && !self.supports_ranges() {
            return Err(SedError::FeatureUnsupported { feature: "locking ranges" });
        }
        Ok(locking::range(range))
    }

    /// Read one range's locking state.
    pub fn get_locking_info(
        self,
        session: &mut Session,
        range: u32,
    ) -> Result<LockingRangeInfo> {
        let uid = self.range_uid(range)?;
        let values =
            get_columns(session, uid, col::RANGE_START, col::WRITE_LOCKED)?;
        Ok(LockingRangeInfo {
            range_id: range,
            range_start: named_u64(&values, col::RANGE_START).unwrap_or(0),
            range_length: named_u64(&values, col::RANGE_LENGTH).unwrap_or(0),
            read_lock_enabled: named_flag(&values, col::READ_LOCK_ENABLED),
            write_lock_enabled: named_flag(&values, col::WRITE_LOCK_ENABLED),
            read_locked: named_flag(&values, col::READ_LOCKED),
            write_locked: named_flag(&values, col::WRITE_LOCKED),
        })
    }

    /// Set a range's lock state.
    pub fn set_range_lock(
        self,
        session: &mut Session,
        range: u32,
        read_locked: bool,
        write_locked: bool,
    ) -> Result<()> {
        let uid = self.range_uid(range)?;
        set_columns(
            session,
            uid,
            &[
                (col::READ_LOCKED, Token::Uint(u64::from(read_locked))),
                (col::WRITE_LOCKED, Token::Uint(u64::from(write_locked))),
            ],
        )
    }

    /// Lock a band for both reads and writes (Enterprise vocabulary for
    /// [`SscAdapter::set_range_lock`]).
    pub fn lock_band(self, session: &mut Session, band: u32) -> Result<()> {
        self.set_range_lock(session, band, true, true)
    }

    /// Unlock a band.
    pub fn unlock_band(self, session: &mut Session, band: u32) -> Result<()> {
        self.set_range_lock(session, band, false, false)
    }

    /// Number of configurable ranges the Locking SP reports.
    pub fn max_ranges(self, session: &mut Session) -> Result<u64> {
        if !self.supports_ranges() {
            return Ok(0);
        }
        let values = get_columns(session, locking::INFO, col::MAX_RANGES, col::MAX_RANGES)?;
        named_u64(&values, col::MAX_RANGES)
            .ok_or(SedError::MethodMalformed { reason: "locking info has no max ranges" })
    }

    /// Configure a non-global range's geometry and enable its locks.
    ///
    /// The global range has no geometry; passing range 0 is refused, as is
    /// a range id beyond the drive's reported maximum.
    pub fn configure_range(
        self,
        session: &mut Session,
        range: u32,
        start: u64,
        length: u64,
    ) -> Result<()> {
        if range == 0 {
            return Err(SedError::InvalidArgument {
                reason: "global range geometry is fixed".to_string(),
            });
        }
        let max = self.max_ranges(session)?;
        if u64::from(range) > max {
            return Err(SedError::InvalidArgument {
                reason: format!("range {range} exceeds drive maximum {max}"),
            });
        }
        let uid = self.range_uid(range)?;
        set_columns(
            session,
            uid,
            &[
                (col::RANGE_START, Token::Uint(start)),
                (col::RANGE_LENGTH, Token::Uint(length)),
                (col::READ_LOCK_ENABLED, Token::Uint(1)),
                (col::WRITE_LOCK_ENABLED, Token::Uint(1)),
            ],
        )
    }

    /// Enable Locking SP user authority `n`.
    pub fn enable_user(self, session: &mut Session, n: u32) -> Result<()> {
        if n == 0 {
            return Err(SedError::InvalidArgument { reason: "user ids are 1-based".into() });
        }
        set_columns(
            session,
            sedframe_proto::uid::auth::user(n),
            &[(col::AUTHORITY_ENABLED, Token::Uint(1))],
        )
    }

    /// Replace a C_PIN credential.
    pub fn set_cpin(
        self,
        session: &mut Session,
        cpin: Uid,
        new_credential: &crate::auth::Credential,
    ) -> Result<()> {
        set_columns(
            session,
            cpin,
            &[(col::CPIN_PIN, Token::Bytes(new_credential.as_bytes().to_vec()))],
        )
    }

    /// Read a C_PIN credential (only MSID is readable unauthenticated).
    pub fn get_cpin(self, session: &mut Session, cpin: Uid) -> Result<Vec<u8>> {
        let values = get_columns(session, cpin, col::CPIN_PIN, col::CPIN_PIN)?;
        values
            .into_iter()
            .find(|(c, _)| *c == col::CPIN_PIN)
            .and_then(|(_, v)| v.as_bytes().map(<[u8]>::to_vec))
            .ok_or(SedError::MethodMalformed { reason: "c_pin row has no pin column" })
    }

    /// Crypto-erase a range by cycling its media key.
    ///
    /// Opal drives regenerate the range's active key with `GenKey`;
    /// Enterprise drives use the band `Erase` method; Pyrite has no media
    /// encryption to erase.
    pub fn crypto_erase(self, session: &mut Session, range: u32) -> Result<()> {
        if !self.supports_crypto_erase() {
            return Err(SedError::FeatureUnsupported { feature: "crypto erase" });
        }
        match self {
            Self::Enterprise => {
                let uid = self.range_uid(range)?;
                method::invoke(session, &MethodCall::new(uid, method_uid::ERASE))?;
                Ok(())
            },
            _ => {
                let uid = self.range_uid(range)?;
                let values = get_columns(session, uid, col::ACTIVE_KEY, col::ACTIVE_KEY)?;
                let key = values
                    .iter()
                    .find(|(c, _)| *c == col::ACTIVE_KEY)
                    .and_then(|(_, v)| Uid::from_token(v))
                    .ok_or(SedError::MethodMalformed {
                        reason: "range has no active key uid",
                    })?;
                method::invoke(session, &MethodCall::new(key, method_uid::GENKEY))?;
                Ok(())
            },
        }
    }

    /// Activate a manufactured-inactive SP (Opal/Pyrite Locking SP).
    pub fn activate(self, session: &mut Session, sp: Uid) -> Result<()> {
        if !self.requires_activation() {
            return Err(SedError::FeatureUnsupported { feature: "activate" });
        }
        method::invoke(session, &MethodCall::new(sp, method_uid::ACTIVATE))?;
        Ok(())
    }

    /// Revert an SP to manufactured state.
    pub fn revert_sp(self, session: &mut Session, sp: Uid) -> Result<()> {
        method::invoke(session, &MethodCall::new(sp, method_uid::REVERT))?;
        Ok(())
    }

    /// Read an SP's lifecycle state column.
    pub fn get_sp_lifecycle(self, session: &mut Session, sp: Uid) -> Result<u8> {
        let values = get_columns(session, sp, col::SP_LIFECYCLE, col::SP_LIFECYCLE)?;
        named_u64(&values, col::SP_LIFECYCLE)
            .and_then(|v| u8::try_from(v).ok())
            .ok_or(SedError::MethodMalformed { reason: "sp row has no lifecycle column" })
    }
}
