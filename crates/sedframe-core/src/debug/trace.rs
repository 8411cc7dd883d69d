//! Bounded trace ring for fault-point events.

use std::time::Duration;

use crate::error::SedError;

/// Default ring capacity when `trace_capacity` is not configured.
pub const DEFAULT_TRACE_CAPACITY: usize = 1024;

/// One recorded fault-point event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Time since the owning context was created
    pub at: Duration,
    /// Observation-site name the event was recorded at
    pub tag: &'static str,
    /// Name of the fault that fired
    pub detail: String,
    /// Error the fault produced; `None` for pass-through actions
    pub outcome: Option<SedError>,
}
