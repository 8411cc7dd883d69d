//! Error types for the wire-format layer.
//!
//! Codec and framing errors are fatal to the message being processed but
//! carry enough context (offset, reason) for an evaluation platform to
//! pinpoint the malformed byte. They deliberately do not implicate the
//! session: whether a framing error closes the session is decided by the
//! engine in `sedframe-core`.

use thiserror::Error;

/// Errors produced while encoding or decoding TCG wire structures.
///
/// All variants are `Clone` so fault-injection records can store a prepared
/// error to return at a later observation point.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Token stream contained a malformed atom header, an integer atom wider
    /// than 8 bytes, or was truncated mid-atom.
    #[error("invalid token encoding at offset {offset}: {reason}")]
    TokenInvalidEncoding {
        /// Byte offset of the offending atom header
        offset: usize,
        /// What was wrong with it
        reason: &'static str,
    },

    /// ComPacket / Packet / SubPacket header failed validation.
    #[error("com packet malformed: {reason}")]
    ComPacketMalformed {
        /// Which header invariant was violated
        reason: &'static str,
    },

    /// A length field claimed more bytes than the enclosing layer provides.
    #[error("com packet oversize: {size} bytes exceeds limit of {max}")]
    ComPacketOversize {
        /// Claimed size in bytes
        size: usize,
        /// Maximum the enclosing layer (or negotiated property) allows
        max: usize,
    },

    /// ComPacket carried no Data SubPackets while the outstanding-data and
    /// min-transfer fields were both zero, so there is nothing to wait for.
    #[error("com packet carried no data sub packets")]
    ComPacketEmpty,

    /// Level 0 Discovery response failed structural validation.
    #[error("discovery response malformed: {reason}")]
    DiscoveryMalformed {
        /// Which part of the response was unparseable
        reason: &'static str,
    },
}

/// Convenience alias used throughout the wire-format layer.
pub type Result<T> = std::result::Result<T, ProtocolError>;
