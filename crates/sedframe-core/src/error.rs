//! Error taxonomy for the protocol engine.
//!
//! Errors are returned, never thrown; a failed method call does not by
//! itself close its session unless the TPer state is known-inconsistent
//! (session-number desync on an unwrap). Callers distinguish fatal from
//! retryable errors by inspecting the kind via [`SedError::is_transient`],
//! never by parsing messages.

use sedframe_proto::{MethodStatus, ProtocolError};
use thiserror::Error;

/// Errors produced by the protocol engine.
///
/// `Clone` so fault records can hold a prepared error to inject, and so
/// [`crate::method::RawResult`] can carry the error of the round it
/// describes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SedError {
    /// Underlying device I/O failed.
    #[error("transport error: {reason}")]
    Transport {
        /// Description from the transport implementation
        reason: String,
    },

    /// A blocking operation exceeded its composed deadline.
    #[error("transport timeout after {elapsed_ms} ms")]
    Timeout {
        /// Milliseconds spent before giving up
        elapsed_ms: u64,
    },

    /// Framing, codec or discovery parse error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The TPer returned a non-success status for a method call.
    #[error("method failed: {0}")]
    MethodStatus(MethodStatus),

    /// The TPer returned a different number of out-parameters than the
    /// caller expected.
    #[error("method result shape: expected {expected} out-parameters, got {actual}")]
    MethodResultShape {
        /// Out-parameter count the caller expected
        expected: usize,
        /// Count actually present in the response
        actual: usize,
    },

    /// The method response token stream did not have the required
    /// `EndOfData` / status-list shape.
    #[error("method response malformed: {reason}")]
    MethodMalformed {
        /// Which part of the response was wrong
        reason: &'static str,
    },

    /// StartSession was rejected by the TPer.
    #[error("session start failed: {status}")]
    SessionStartFailed {
        /// Status the TPer answered with
        status: MethodStatus,
    },

    /// The session is closed; no further methods may be invoked on it.
    #[error("session is closed")]
    SessionClosed,

    /// The security provider answered SP_BUSY to StartSession.
    #[error("security provider busy")]
    SessionBusy,

    /// The operation requires a feature this drive's discovery lacks.
    #[error("feature unsupported: {feature}")]
    FeatureUnsupported {
        /// Name of the missing feature or capability
        feature: &'static str,
    },

    /// Caller-supplied value was out of range.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was out of range
        reason: String,
    },

    /// A test-context fault fired at an observation point.
    #[error("fault injected: {name}")]
    FaultInjected {
        /// Name the fault was armed under
        name: String,
    },
}

impl SedError {
    /// True if the operation may succeed when retried: the SP was busy, the
    /// TPer had no free session slot, or the deadline expired. Protocol
    /// violations and authorization failures are never transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::SessionBusy
                | Self::MethodStatus(MethodStatus::SpBusy)
                | Self::MethodStatus(MethodStatus::NoSessionsAvailable)
        )
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, SedError>;
