//! Object and method UID tables, and method status codes.
//!
//! UIDs are 8-byte identifiers in the TCG data model. The tables here cover
//! the objects the SSC adapters touch: security providers, authorities,
//! C_PIN credentials, locking ranges and the session-manager and table
//! methods. Per-SSC variations (admin/user counts) are handled by the
//! constructor functions taking an index.

use crate::errors::ProtocolError;
use crate::token::Token;

/// An 8-byte object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u64);

impl Uid {
    /// Big-endian wire form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parse from an 8-byte big-endian slice. `None` if the length is wrong.
    #[must_use]
    pub fn from_slice(b: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = b.try_into().ok()?;
        Some(Self(u64::from_be_bytes(arr)))
    }

    /// Parse from a byte-sequence token of exactly 8 bytes.
    #[must_use]
    pub fn from_token(t: &Token) -> Option<Self> {
        t.as_bytes().and_then(Self::from_slice)
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Session-manager layer objects and methods.
///
/// Session-manager calls are invoked on [`sm::SMUID`] inside Packets with
/// both session numbers zero.
pub mod sm {
    use super::Uid;

    /// Session manager invoking UID
    pub const SMUID: Uid = Uid(0x0000_0000_0000_0001);
    /// Properties exchange
    pub const PROPERTIES: Uid = Uid(0x0000_0000_00FF_0001);
    /// StartSession
    pub const START_SESSION: Uid = Uid(0x0000_0000_00FF_0002);
    /// SyncSession (TPer's response method)
    pub const SYNC_SESSION: Uid = Uid(0x0000_0000_00FF_0003);
}

/// Security providers and the in-session `this` object.
pub mod sp {
    use super::Uid;

    /// The SP a session is currently open against
    pub const THIS_SP: Uid = Uid(0x0000_0000_0000_0005);
    /// Admin SP
    pub const ADMIN: Uid = Uid(0x0000_0205_0000_0001);
    /// Locking SP
    pub const LOCKING: Uid = Uid(0x0000_0205_0000_0002);
}

/// Authority objects.
pub mod auth {
    use super::Uid;

    /// Anybody (no credential)
    pub const ANYBODY: Uid = Uid(0x0000_0009_0000_0001);
    /// Drive owner
    pub const SID: Uid = Uid(0x0000_0009_0000_0000);
    /// Physical-presence revert authority
    pub const PSID: Uid = Uid(0x0000_0009_0001_FF01);
    /// First Locking SP admin
    pub const ADMIN1: Uid = Uid(0x0000_0009_0001_0001);
    /// First Locking SP user
    pub const USER1: Uid = Uid(0x0000_0009_0003_0001);

    /// Locking SP admin authority `n` (1-based).
    #[must_use]
    pub fn admin(n: u32) -> Uid {
        Uid(0x0000_0009_0001_0000 + u64::from(n))
    }

    /// Locking SP user authority `n` (1-based).
    #[must_use]
    pub fn user(n: u32) -> Uid {
        Uid(0x0000_0009_0003_0000 + u64::from(n))
    }
}

/// C_PIN credential objects.
pub mod cpin {
    use super::Uid;

    /// Owner credential
    pub const SID: Uid = Uid(0x0000_000B_0000_0001);
    /// Factory default credential, readable without authentication
    pub const MSID: Uid = Uid(0x0000_000B_0000_8402);
    /// First Locking SP admin credential
    pub const ADMIN1: Uid = Uid(0x0000_000B_0001_0001);

    /// Locking SP admin credential `n` (1-based).
    #[must_use]
    pub fn admin(n: u32) -> Uid {
        Uid(0x0000_000B_0001_0000 + u64::from(n))
    }

    /// Locking SP user credential `n` (1-based).
    #[must_use]
    pub fn user(n: u32) -> Uid {
        Uid(0x0000_000B_0003_0000 + u64::from(n))
    }
}

/// Locking table objects.
pub mod locking {
    use super::Uid;

    /// LockingInfo table row (max-ranges and friends)
    pub const INFO: Uid = Uid(0x0000_0801_0000_0001);
    /// Global range
    pub const GLOBAL_RANGE: Uid = Uid(0x0000_0802_0000_0001);
    /// MBR control object
    pub const MBR_CONTROL: Uid = Uid(0x0000_0803_0000_0001);

    /// Non-global locking range `n` (1-based); range 0 is the global range.
    #[must_use]
    pub fn range(n: u32) -> Uid {
        if n == 0 { GLOBAL_RANGE } else { Uid(0x0000_0802_0003_0000 + u64::from(n)) }
    }
}

/// Access-control elements referenced when granting range access.
pub mod ace {
    use super::Uid;

    /// ACE guarding `Set(ReadLocked/WriteLocked)` on locking range `n`.
    #[must_use]
    pub fn locking_range_set_rdlocked(n: u32) -> Uid {
        Uid(0x0000_0008_0003_E000 + u64::from(n))
    }

    /// ACE guarding `Set(ReadLocked/WriteLocked)` on the global range.
    pub const GLOBAL_RANGE_SET_RDLOCKED: Uid = Uid(0x0000_0008_0003_E000);
}

/// Table methods (invoked on an object UID).
pub mod method {
    use super::Uid;

    /// Iterate table rows
    pub const NEXT: Uid = Uid(0x0000_0006_0000_0008);
    /// Read cells
    pub const GET: Uid = Uid(0x0000_0006_0000_0016);
    /// Write cells
    pub const SET: Uid = Uid(0x0000_0006_0000_0017);
    /// Prove an authority
    pub const AUTHENTICATE: Uid = Uid(0x0000_0006_0000_001C);
    /// Regenerate a media encryption key
    pub const GENKEY: Uid = Uid(0x0000_0006_0000_0010);
    /// Revert the containing SP
    pub const REVERT_SP: Uid = Uid(0x0000_0006_0000_0011);
    /// Revert the TPer (invoked on an SP object)
    pub const REVERT: Uid = Uid(0x0000_0006_0000_0202);
    /// Activate an SP (invoked on an SP object)
    pub const ACTIVATE: Uid = Uid(0x0000_0006_0000_0203);
    /// Enterprise band erase
    pub const ERASE: Uid = Uid(0x0000_0006_0000_0803);
}

/// Table column indices used by the adapters.
pub mod col {
    /// C_PIN.PIN
    pub const CPIN_PIN: u64 = 3;
    /// Authority.Enabled
    pub const AUTHORITY_ENABLED: u64 = 5;
    /// Locking.RangeStart
    pub const RANGE_START: u64 = 3;
    /// Locking.RangeLength
    pub const RANGE_LENGTH: u64 = 4;
    /// Locking.ReadLockEnabled
    pub const READ_LOCK_ENABLED: u64 = 5;
    /// Locking.WriteLockEnabled
    pub const WRITE_LOCK_ENABLED: u64 = 6;
    /// Locking.ReadLocked
    pub const READ_LOCKED: u64 = 7;
    /// Locking.WriteLocked
    pub const WRITE_LOCKED: u64 = 8;
    /// Locking.LockOnReset
    pub const LOCK_ON_RESET: u64 = 9;
    /// Locking.ActiveKey
    pub const ACTIVE_KEY: u64 = 10;
    /// LockingInfo.MaxRanges
    pub const MAX_RANGES: u64 = 4;
    /// SP.LifeCycleState
    pub const SP_LIFECYCLE: u64 = 6;
}

/// Cell-block and Set parameter names.
pub mod param {
    /// Cell block: first column to read
    pub const START_COLUMN: u64 = 3;
    /// Cell block: last column to read
    pub const END_COLUMN: u64 = 4;
    /// Set: where clause
    pub const WHERE: u64 = 0;
    /// Set: values list
    pub const VALUES: u64 = 1;
    /// StartSession: host challenge
    pub const HOST_CHALLENGE: u64 = 0;
    /// StartSession: host exchange authority
    pub const HOST_EXCHANGE_AUTHORITY: u64 = 1;
    /// StartSession: host signing authority
    pub const HOST_SIGNING_AUTHORITY: u64 = 3;
    /// StartSession: session timeout in milliseconds
    pub const SESSION_TIMEOUT: u64 = 5;
    /// Authenticate: challenge
    pub const CHALLENGE: u64 = 0;
}

/// Status code from the terminal status list of a method response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MethodStatus {
    /// Method completed
    Success = 0x00,
    /// Authority lacks access to the method or object
    NotAuthorized = 0x01,
    /// A parameter was out of range or mistyped
    InvalidParameter = 0x06,
    /// SP is busy; the call may be retried
    SpBusy = 0x07,
    /// SP is in a failed state
    SpFailed = 0x08,
    /// Uniqueness constraint violated
    UniquenessConflict = 0x09,
    /// TPer has no free session slots
    NoSessionsAvailable = 0x0F,
    /// Authority is locked out after failed tries
    AuthorityLockedOut = 0x12,
    /// Unspecified failure
    Fail = 0x3F,
}

impl MethodStatus {
    /// Map a raw status byte. `None` for codes outside the known set.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Success),
            0x01 => Some(Self::NotAuthorized),
            0x06 => Some(Self::InvalidParameter),
            0x07 => Some(Self::SpBusy),
            0x08 => Some(Self::SpFailed),
            0x09 => Some(Self::UniquenessConflict),
            0x0F => Some(Self::NoSessionsAvailable),
            0x12 => Some(Self::AuthorityLockedOut),
            0x3F => Some(Self::Fail),
            _ => None,
        }
    }

    /// Map a decoded status token, rejecting out-of-range values.
    pub fn from_token(t: &Token) -> Result<Self, ProtocolError> {
        let v = t.as_uint().and_then(|v| u8::try_from(v).ok()).ok_or(
            ProtocolError::TokenInvalidEncoding { offset: 0, reason: "status is not a byte" },
        )?;
        Self::from_u8(v).ok_or(ProtocolError::TokenInvalidEncoding {
            offset: 0,
            reason: "unknown method status code",
        })
    }

    /// True for [`MethodStatus::Success`].
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl std::fmt::Display for MethodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::SpBusy => "SP_BUSY",
            Self::SpFailed => "SP_FAILED",
            Self::UniquenessConflict => "UNIQUENESS_CONFLICT",
            Self::NoSessionsAvailable => "NO_SESSIONS_AVAILABLE",
            Self::AuthorityLockedOut => "AUTHORITY_LOCKED_OUT",
            Self::Fail => "FAIL",
        };
        write!(f, "{name} ({:#04x})", *self as u8)
    }
}
