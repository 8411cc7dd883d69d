//! TCG SED protocol engine.
//!
//! Drives Self-Encrypting Drives over the Trusted Computing Group Storage
//! protocols (Opal 1.0/2.0, Pyrite 1.0/2.0, Enterprise) through a
//! [`Transport`] capability the caller provides:
//!
//! - [`session`]: the StartSession / authenticate / close state machine
//! - [`method`]: CALL construction, dispatch, result parsing
//! - [`discovery`] / [`properties`]: the pre-session handshakes
//! - [`ssc`] / [`device`]: per-SSC adapters and the intent-level recipes
//! - [`pool`]: bounded pool of pre-opened sessions
//! - [`debug`]: fault injection, counters and tracing for evaluation rigs
//!
//! Everything is synchronous: blocking calls are deadline-bounded retries
//! with explicit backoff, so the engine needs no async runtime and can be
//! driven from any thread. Sessions are exclusively owned; the transport
//! and the debug context are the only shared capabilities.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod debug;
pub mod device;
pub mod discovery;
pub mod dump;
pub mod error;
mod exchange;
pub mod method;
pub mod pool;
pub mod properties;
pub mod session;
pub mod ssc;
pub mod transport;

pub use auth::{Credential, PasswordHasher, Sha256Hasher};
pub use debug::{FaultBuilder, FaultPoint, TestContext, TestSession};
pub use device::SedDevice;
pub use error::{Result, SedError};
pub use method::{MethodCall, MethodResult, RawResult};
pub use pool::{PooledSession, SessionPool};
pub use properties::TperProperties;
pub use session::{Session, SessionState, StartSessionOpts, StartSessionResult};
pub use ssc::{LockingRangeInfo, SscAdapter};
pub use transport::{SharedTransport, Transport};
