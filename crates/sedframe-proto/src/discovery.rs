//! Level 0 Discovery response parsing.
//!
//! Discovery is an IF-RECV on protocol 0x01, ComID 0x0001 that returns a
//! header followed by feature descriptors. Each descriptor carries a 16-bit
//! feature code, a 4-bit version, an 8-bit length and a payload. Unknown
//! codes are skipped but preserved verbatim in [`DiscoveryInfo::raw_features`]
//! so evaluation tooling can inspect vendor extensions.

use crate::errors::{ProtocolError, Result};

/// Offset of the first feature descriptor inside the response.
pub const HEADER_LEN: usize = 48;

/// Known feature descriptor codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FeatureCode {
    /// TPer feature
    Tper = 0x0001,
    /// Locking feature
    Locking = 0x0002,
    /// Geometry reporting
    Geometry = 0x0003,
    /// Legacy shadow-MBR descriptor some drives emit
    MbrShadow = 0x0004,
    /// Enterprise SSC
    Enterprise = 0x0100,
    /// Opal SSC 1.0
    Opal10 = 0x0200,
    /// Opal SSC 2.0
    Opal20 = 0x0203,
    /// Pyrite SSC 1.0
    Pyrite10 = 0x0302,
    /// Pyrite SSC 2.0
    Pyrite20 = 0x0303,
}

impl FeatureCode {
    /// Map a raw feature code. `None` for unrecognized codes.
    #[must_use]
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0001 => Some(Self::Tper),
            0x0002 => Some(Self::Locking),
            0x0003 => Some(Self::Geometry),
            0x0004 => Some(Self::MbrShadow),
            0x0100 => Some(Self::Enterprise),
            0x0200 => Some(Self::Opal10),
            0x0203 => Some(Self::Opal20),
            0x0302 => Some(Self::Pyrite10),
            0x0303 => Some(Self::Pyrite20),
            _ => None,
        }
    }
}

/// Security subsystem class reported by a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SscKind {
    /// No SSC descriptor found
    #[default]
    Unknown,
    /// Pyrite 1.0
    Pyrite10,
    /// Pyrite 2.0
    Pyrite20,
    /// Enterprise
    Enterprise,
    /// Opal 1.0
    Opal10,
    /// Opal 2.0
    Opal20,
}

impl SscKind {
    /// Priority used to pick the primary SSC when a drive reports several:
    /// Opal 2.0 > Opal 1.0 > Enterprise > Pyrite 2.0 > Pyrite 1.0.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Pyrite10 => 1,
            Self::Pyrite20 => 2,
            Self::Enterprise => 3,
            Self::Opal10 => 4,
            Self::Opal20 => 5,
        }
    }
}

/// Geometry reporting descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    /// Alignment required flag
    pub align_required: bool,
    /// Logical block size in bytes
    pub logical_block_size: u32,
    /// Alignment granularity in logical blocks
    pub alignment_granularity: u64,
    /// Lowest aligned LBA
    pub lowest_aligned_lba: u64,
}

/// SSC descriptor payload common to the Opal/Pyrite/Enterprise families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SscFeature {
    /// Which SSC this descriptor announced
    pub kind: SscKind,
    /// Base ComID for this SSC
    pub base_com_id: u16,
    /// Number of ComIDs available
    pub num_com_ids: u16,
    /// Range-crossing behavior flag (Opal 2.0)
    pub range_crossing: bool,
    /// Number of Locking SP admin authorities (Opal 2.0)
    pub num_locking_admins: u16,
    /// Number of Locking SP user authorities (Opal 2.0)
    pub num_locking_users: u16,
}

/// An unparsed feature descriptor, preserved for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFeature {
    /// 16-bit feature code
    pub code: u16,
    /// 4-bit descriptor version
    pub version: u8,
    /// Descriptor payload
    pub payload: Vec<u8>,
}

/// Parsed Level 0 Discovery response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoveryInfo {
    /// Highest-priority SSC present
    pub primary_ssc: SscKind,
    /// Base ComID of the primary SSC
    pub base_com_id: u16,
    /// ComID count of the primary SSC
    pub num_com_ids: u16,
    /// TPer feature present
    pub tper_present: bool,
    /// TPer supports synchronous protocol
    pub tper_sync: bool,
    /// Locking feature present
    pub locking_present: bool,
    /// Locking SP activated
    pub locking_enabled: bool,
    /// Some range currently locked
    pub locked: bool,
    /// Media encryption supported
    pub media_encryption: bool,
    /// Shadow MBR enabled
    pub mbr_enabled: bool,
    /// Shadow MBR done bit
    pub mbr_done: bool,
    /// Geometry descriptor, if reported
    pub geometry: Option<Geometry>,
    /// All SSC descriptors found, in response order
    pub ssc_features: Vec<SscFeature>,
    /// Serial string recovered from the vendor-specific header area
    pub serial: Option<String>,
    /// Every descriptor in raw form, recognized or not
    pub raw_features: Vec<RawFeature>,
}

fn be16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

fn be32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn be64(b: &[u8], off: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&b[off..off + 8]);
    u64::from_be_bytes(arr)
}

fn parse_ssc(kind: SscKind, payload: &[u8]) -> Option<SscFeature> {
    if payload.len() < 4 {
        return None;
    }
    let mut f = SscFeature {
        kind,
        base_com_id: be16(payload, 0),
        num_com_ids: be16(payload, 2),
        ..SscFeature::default()
    };
    if payload.len() >= 9 {
        f.range_crossing = payload[4] & 0x01 != 0;
        f.num_locking_admins = be16(payload, 5);
        f.num_locking_users = be16(payload, 7);
    }
    Some(f)
}

/// Parse a raw Level 0 Discovery response.
///
/// # Errors
///
/// [`ProtocolError::DiscoveryMalformed`] when the buffer is shorter than the
/// 48-byte header, the announced parameter length overruns the buffer, or a
/// descriptor header overruns the parameter area. A descriptor whose payload
/// is too short for its code is preserved raw but not interpreted.
pub fn parse(buf: &[u8]) -> Result<DiscoveryInfo> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::DiscoveryMalformed { reason: "response shorter than header" });
    }

    // Bytes 0..4 hold the parameter length, exclusive of the field itself.
    let param_len = be32(buf, 0) as usize;
    let end = param_len
        .checked_add(4)
        .filter(|e| *e <= buf.len())
        .ok_or(ProtocolError::DiscoveryMalformed { reason: "length overruns buffer" })?;
    if end < HEADER_LEN {
        return Err(ProtocolError::DiscoveryMalformed { reason: "length shorter than header" });
    }

    let mut info = DiscoveryInfo {
        serial: parse_serial(&buf[16..48]),
        ..DiscoveryInfo::default()
    };

    let mut pos = HEADER_LEN;
    while pos + 4 <= end {
        let code = be16(buf, pos);
        let version = buf[pos + 2] >> 4;
        let len = usize::from(buf[pos + 3]);
        let body_start = pos + 4;
        let body_end = body_start
            .checked_add(len)
            .filter(|e| *e <= end)
            .ok_or(ProtocolError::DiscoveryMalformed { reason: "descriptor overruns buffer" })?;
        let payload = &buf[body_start..body_end];

        info.raw_features.push(RawFeature { code, version, payload: payload.to_vec() });

        match FeatureCode::from_u16(code) {
            Some(FeatureCode::Tper) if !payload.is_empty() => {
                info.tper_present = true;
                info.tper_sync = payload[0] & 0x01 != 0;
            },
            Some(FeatureCode::Locking) if !payload.is_empty() => {
                info.locking_present = payload[0] & 0x01 != 0;
                info.locking_enabled = payload[0] & 0x02 != 0;
                info.locked = payload[0] & 0x04 != 0;
                info.media_encryption = payload[0] & 0x08 != 0;
                info.mbr_enabled = payload[0] & 0x10 != 0;
                info.mbr_done = payload[0] & 0x20 != 0;
            },
            Some(FeatureCode::Geometry) if payload.len() >= 28 => {
                info.geometry = Some(Geometry {
                    align_required: payload[0] & 0x01 != 0,
                    logical_block_size: be32(payload, 8),
                    alignment_granularity: be64(payload, 12),
                    lowest_aligned_lba: be64(payload, 20),
                });
            },
            Some(FeatureCode::MbrShadow) if !payload.is_empty() => {
                info.mbr_enabled = payload[0] & 0x01 != 0;
                info.mbr_done = payload[0] & 0x02 != 0;
            },
            Some(FeatureCode::Enterprise) => {
                info.ssc_features.extend(parse_ssc(SscKind::Enterprise, payload));
            },
            Some(FeatureCode::Opal10) => {
                info.ssc_features.extend(parse_ssc(SscKind::Opal10, payload));
            },
            Some(FeatureCode::Opal20) => {
                info.ssc_features.extend(parse_ssc(SscKind::Opal20, payload));
            },
            Some(FeatureCode::Pyrite10) => {
                info.ssc_features.extend(parse_ssc(SscKind::Pyrite10, payload));
            },
            Some(FeatureCode::Pyrite20) => {
                info.ssc_features.extend(parse_ssc(SscKind::Pyrite20, payload));
            },
            _ => {},
        }

        pos = body_end;
    }

    if let Some(primary) = info
        .ssc_features
        .iter()
        .max_by_key(|f| f.kind.priority())
        .copied()
    {
        info.primary_ssc = primary.kind;
        info.base_com_id = primary.base_com_id;
        info.num_com_ids = primary.num_com_ids;
    }

    Ok(info)
}

/// Recover a printable serial from the vendor-specific header bytes.
fn parse_serial(vendor: &[u8]) -> Option<String> {
    let trimmed: Vec<u8> =
        vendor.iter().copied().take_while(|b| *b != 0).collect();
    if trimmed.is_empty() || !trimmed.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return None;
    }
    String::from_utf8(trimmed).ok().map(|s| s.trim().to_string())
}
