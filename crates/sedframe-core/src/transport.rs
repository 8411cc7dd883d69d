//! Transport capability the engine consumes.
//!
//! A [`Transport`] wraps one device's trusted-command channel. The engine
//! only ever calls the capability set below; the platform-specific syscalls
//! (SG_IO, NVMe admin ioctls, ATA TRUSTED SEND/RECEIVE) live in implementor
//! crates. One transport is shared by all sessions opened against its
//! device; implementations must serialize concurrent trusted-command pairs
//! to the same device themselves.

use std::sync::Arc;

use crate::error::{Result, SedError};

/// Security protocol 0x00: security support discovery.
pub const PROTOCOL_SECURITY: u8 = 0x00;

/// Security protocol 0x01: TCG communication.
pub const PROTOCOL_TCG: u8 = 0x01;

/// Security protocol 0x02: reserved TCG dataplane.
pub const PROTOCOL_TCG_RESERVED: u8 = 0x02;

/// An intentionally invalid protocol id, used by negative tests.
pub const PROTOCOL_INVALID: u8 = 0x05;

/// ComID on which Level 0 Discovery is answered.
pub const DISCOVERY_COM_ID: u16 = 0x0001;

/// Trusted-command payload granularity: transfers are padded to this.
pub const TRUSTED_BLOCK_SIZE: usize = 512;

/// Trusted send/receive capability for one device.
///
/// Implementations must be safe to share across threads; each individual
/// `if_send` + `if_recv` pair is treated as indivisible by the engine.
pub trait Transport: Send + Sync {
    /// Issue a trusted send (IF-SEND / TRUSTED SEND) carrying `payload`.
    fn if_send(&self, protocol_id: u8, com_id: u16, payload: &[u8]) -> Result<()>;

    /// Issue a trusted receive (IF-RECV / TRUSTED RECEIVE), returning at
    /// most `max_len` bytes.
    fn if_recv(&self, protocol_id: u8, com_id: u16, max_len: usize) -> Result<Vec<u8>>;

    /// Controller/namespace identify data, for transports that expose it.
    fn identify(&self, namespace_id: u32, cns: u32) -> Result<Vec<u8>> {
        let _ = (namespace_id, cns);
        Err(SedError::FeatureUnsupported { feature: "identify" })
    }

    /// Device log page, for transports that expose it.
    fn get_log_page(&self, lid: u32, namespace_id: u32, len: usize) -> Result<Vec<u8>> {
        let _ = (lid, namespace_id, len);
        Err(SedError::FeatureUnsupported { feature: "get_log_page" })
    }

    /// Device feature register, for transports that expose it. Returns the
    /// completion dword and any attached buffer.
    fn get_feature(&self, fid: u32, selector: u32) -> Result<(u32, Vec<u8>)> {
        let _ = (fid, selector);
        Err(SedError::FeatureUnsupported { feature: "get_feature" })
    }

    /// True while the underlying device handle is usable.
    fn is_open(&self) -> bool;
}

/// Shared-owning handle to a transport; its lifetime covers every session
/// derived from it.
pub type SharedTransport = Arc<dyn Transport>;
