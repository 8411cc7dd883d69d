//! Deterministic test harness for the sedframe protocol engine.
//!
//! [`FakeTper`] is a software drive implementing the engine's `Transport`
//! trait, answering the TCG method layer from in-memory state; the
//! `fixtures` module builds canned Level 0 Discovery responses. Together
//! they let the scenario suites in `tests/` exercise sessions, method
//! dispatch, SSC adapters, fault injection and the session pool end to end
//! with no hardware.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fake_tper;
pub mod fixtures;

pub use fake_tper::{FakeTper, FakeTperConfig};
pub use fixtures::DiscoveryFixture;
