//! Wire-format layer for the TCG Storage protocol.
//!
//! Everything in this crate is pure byte manipulation with no I/O:
//! - [`token`]: the atom/control-token codec that every method payload is
//!   built from
//! - [`compacket`]: the three-layer ComPacket → Packet → SubPacket framing
//! - [`discovery`]: the Level 0 Discovery response parser
//! - [`uid`]: object/method UID tables and method status codes
//!
//! The protocol engine (session state machine, method invoker, transports)
//! lives in `sedframe-core` and consumes these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod compacket;
pub mod discovery;
pub mod errors;
pub mod token;
pub mod uid;

pub use compacket::{ComPacketHeader, FrameParams, PacketHeader, SubPacketHeader, Unwrapped};
pub use discovery::{DiscoveryInfo, FeatureCode, Geometry, RawFeature, SscFeature, SscKind};
pub use errors::{ProtocolError, Result};
pub use token::{Token, TokenReader, TokenWriter};
pub use uid::{MethodStatus, Uid};
