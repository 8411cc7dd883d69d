//! Debug/test layer: fault injection, counters, config and tracing.
//!
//! Evaluation platforms interpose on the protocol engine through a
//! [`TestContext`]: a registry of armed faults, a typed config map with a
//! per-session overlay, monotonic counters and a bounded trace ring. The
//! engine consults the context at well-defined observation sites (see
//! [`FaultPoint`]); while the context is disabled every hook is a single
//! atomic load.
//!
//! There is one process-wide context reachable via [`TestContext::global`],
//! but everything also works against an explicitly constructed context so
//! tests can run isolated instances in parallel.

mod fault;
mod testsession;
mod trace;

pub use fault::{Fault, FaultAction, FaultBuilder, FaultCallback, FaultPoint, FaultTrigger};
pub use testsession::TestSession;
pub use trace::{DEFAULT_TRACE_CAPACITY, TraceEvent};

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering}},
    time::Instant,
};

use crate::error::Result;

/// Counter names maintained by the engine.
pub mod counter {
    /// IF-SEND calls issued
    pub const TRANSPORT_SEND: &str = "transport.send";
    /// IF-RECV calls issued
    pub const TRANSPORT_RECV: &str = "transport.recv";
    /// Method retries performed under the SP_BUSY workaround
    pub const METHOD_RETRY: &str = "method.retry";
    /// Sessions successfully opened
    pub const SESSION_OPEN: &str = "session.open";
    /// Sessions closed
    pub const SESSION_CLOSE: &str = "session.close";
}

/// Named boolean workaround flags, stored in the global config map.
pub mod workaround {
    /// Retry method calls that answer SP_BUSY, up to `max_retries`
    pub const RETRY_ON_SP_BUSY: &str = "retry_on_sp_busy";
    /// Extend I/O deadlines to `timeout_extend_ms`
    pub const EXTEND_TIMEOUT: &str = "extend_timeout";
    /// SSC adapters skip revert confirmation
    pub const SKIP_REVERT_CONFIRM: &str = "skip_revert_confirm";
}

/// Recognized configuration keys.
pub mod config_key {
    /// u64: base deadline override for all I/O, in milliseconds
    pub const TIMEOUT_EXTEND_MS: &str = "timeout_extend_ms";
    /// i64: retry budget for SP_BUSY and transient errors
    pub const MAX_RETRIES: &str = "max_retries";
    /// bool: SSC adapters skip revert confirmation
    pub const SKIP_REVERT_CONFIRM: &str = "skip_revert_confirm";
    /// string: discovery runner overrides the reported serial
    pub const INJECT_SERIAL: &str = "inject_serial";
    /// u64: trace ring capacity
    pub const TRACE_CAPACITY: &str = "trace_capacity";
}

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    /// Signed integer
    I64(i64),
    /// Unsigned integer
    U64(u64),
    /// Boolean flag
    Bool(bool),
    /// String
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl ConfigValue {
    /// Unsigned view; accepts a non-negative `I64` too.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(v) => Some(*v),
            Self::I64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Signed view; accepts a fitting `U64` too.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            Self::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Boolean view.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String view.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Bytes view.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<u64> for ConfigValue {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for ConfigValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

#[derive(Default)]
struct Inner {
    global_config: HashMap<String, ConfigValue>,
    session_config: HashMap<(String, String), ConfigValue>,
    counters: HashMap<String, u64>,
    faults: Vec<Fault>,
    trace: VecDeque<TraceEvent>,
}

impl Inner {
    fn trace_capacity(&self) -> usize {
        self.global_config
            .get(config_key::TRACE_CAPACITY)
            .and_then(ConfigValue::as_u64)
            .map_or(DEFAULT_TRACE_CAPACITY, |v| v as usize)
    }

    fn push_trace(&mut self, event: TraceEvent) {
        let cap = self.trace_capacity().max(1);
        while self.trace.len() >= cap {
            self.trace.pop_front();
        }
        self.trace.push_back(event);
    }
}

/// Fault registry, config map, counters and trace ring.
///
/// Mutators take an internal mutex; the enabled check on the observation
/// path is a lock-free atomic load so a disabled context costs nothing.
pub struct TestContext {
    enabled: AtomicBool,
    epoch: Instant,
    inner: Mutex<Inner>,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    /// Create an independent, disabled context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            epoch: Instant::now(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The process-wide context. Sessions constructed without an explicit
    /// context observe through this one.
    pub fn global() -> Arc<TestContext> {
        static GLOBAL: OnceLock<Arc<TestContext>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(TestContext::new())))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turn observation hooks on.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Turn observation hooks off; every hook becomes a no-op.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether hooks are currently active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Disable and drop all faults, config, counters and trace.
    pub fn reset(&self) {
        self.disable();
        *self.lock() = Inner::default();
    }

    // ── Config ──────────────────────────────────────────────

    /// Set a global config value.
    pub fn set_global_config(&self, name: impl Into<String>, value: ConfigValue) {
        self.lock().global_config.insert(name.into(), value);
    }

    /// Remove a global config value.
    pub fn remove_global_config(&self, name: &str) {
        self.lock().global_config.remove(name);
    }

    /// Set a per-session overlay value.
    pub fn set_session_config(
        &self,
        session: impl Into<String>,
        name: impl Into<String>,
        value: ConfigValue,
    ) {
        self.lock().session_config.insert((session.into(), name.into()), value);
    }

    /// Look up a config value: the session overlay first (when a session is
    /// given), falling back to the global map.
    #[must_use]
    pub fn config(&self, name: &str, session: Option<&str>) -> Option<ConfigValue> {
        let inner = self.lock();
        if let Some(s) = session
            && let Some(v) = inner.session_config.get(&(s.to_string(), name.to_string()))
        {
            return Some(v.clone());
        }
        inner.global_config.get(name).cloned()
    }

    /// Typed config lookup: unsigned integer.
    #[must_use]
    pub fn config_u64(&self, name: &str, session: Option<&str>) -> Option<u64> {
        self.config(name, session).and_then(|v| v.as_u64())
    }

    /// Typed config lookup: signed integer.
    #[must_use]
    pub fn config_i64(&self, name: &str, session: Option<&str>) -> Option<i64> {
        self.config(name, session).and_then(|v| v.as_i64())
    }

    /// Typed config lookup: boolean.
    #[must_use]
    pub fn config_bool(&self, name: &str, session: Option<&str>) -> Option<bool> {
        self.config(name, session).and_then(|v| v.as_bool())
    }

    /// Typed config lookup: string.
    #[must_use]
    pub fn config_str(&self, name: &str, session: Option<&str>) -> Option<String> {
        self.config(name, session).and_then(|v| v.as_str().map(str::to_string))
    }

    /// True when the named workaround flag is set.
    #[must_use]
    pub fn workaround_active(&self, flag: &str) -> bool {
        self.is_enabled() && self.config_bool(flag, None).unwrap_or(false)
    }

    // ── Counters ────────────────────────────────────────────

    /// Increment a counter. No-op while disabled.
    pub fn bump(&self, name: &str) {
        if !self.is_enabled() {
            return;
        }
        *self.lock().counters.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Current value of a counter (0 if never bumped).
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn counters(&self) -> HashMap<String, u64> {
        self.lock().counters.clone()
    }

    // ── Faults ──────────────────────────────────────────────

    /// Arm a fault with no owning test session.
    pub fn arm(&self, builder: FaultBuilder) -> Result<()> {
        self.arm_owned(builder, None)
    }

    pub(crate) fn arm_owned(&self, builder: FaultBuilder, owner: Option<String>) -> Result<()> {
        let fault = builder.build(owner)?;
        tracing::debug!(name = %fault.name, point = fault.point.name(), "fault armed");
        self.lock().faults.push(fault);
        Ok(())
    }

    /// Remove a fault by name. Returns true if one was removed.
    pub fn disarm(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let before = inner.faults.len();
        inner.faults.retain(|f| f.name != name);
        inner.faults.len() != before
    }

    /// How many times the named fault has fired, spent or not. `None` if no
    /// such fault is registered.
    #[must_use]
    pub fn fault_fired(&self, name: &str) -> Option<u64> {
        self.lock().faults.iter().find(|f| f.name == name).map(|f| f.fired)
    }

    /// Evaluate faults at an observation site, with no scope label.
    ///
    /// `buf` is the in-flight buffer; corrupt/replace/callback actions
    /// mutate it in place. An error return short-circuits the observed
    /// operation with that error.
    pub fn observe(&self, point: FaultPoint, buf: &mut Vec<u8>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.observe_scoped(point, None, buf)
    }

    /// Evaluate faults at an observation site with a scope label; faults
    /// armed with [`FaultBuilder::scoped`] only match an equal label.
    pub fn observe_scoped(
        &self,
        point: FaultPoint,
        scope: Option<&str>,
        buf: &mut Vec<u8>,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut callback: Option<FaultCallback> = None;
        let mut fired: Option<String> = None;
        let mut outcome: Result<()> = Ok(());

        {
            let mut inner = self.lock();
            if let Some(f) = inner.faults.iter_mut().find(|f| f.matches(point, scope)) {
                f.fired += 1;
                if let FaultTrigger::Times(n) = &mut f.trigger {
                    *n -= 1;
                    if *n == 0 {
                        f.spent = true;
                    }
                }
                fired = Some(f.name.clone());
                match &f.action {
                    FaultAction::ReturnError(e) => outcome = Err(e.clone()),
                    FaultAction::CorruptByte { offset, xor } => {
                        if let Some(b) = buf.get_mut(*offset) {
                            *b ^= xor;
                        }
                    },
                    FaultAction::ReplaceWith(bytes) => {
                        buf.clear();
                        buf.extend_from_slice(bytes);
                    },
                    FaultAction::Callback(c) => callback = Some(Arc::clone(c)),
                }
            }
        }

        // The callback runs outside the registry lock; re-entering context
        // mutation from inside it is disallowed by contract.
        if let Some(c) = callback {
            let mut f = c.lock().unwrap_or_else(PoisonError::into_inner);
            outcome = (f)(buf);
        }

        if let Some(name) = fired {
            tracing::trace!(fault = %name, point = point.name(), ok = outcome.is_ok(), "fault fired");
            let event = TraceEvent {
                at: self.epoch.elapsed(),
                tag: point.name(),
                detail: name,
                outcome: outcome.as_ref().err().cloned(),
            };
            self.lock().push_trace(event);
        }

        outcome
    }

    // ── Trace ───────────────────────────────────────────────

    /// Snapshot of the trace ring, oldest first.
    #[must_use]
    pub fn trace(&self) -> Vec<TraceEvent> {
        self.lock().trace.iter().cloned().collect()
    }

    /// Drop all trace events.
    pub fn clear_trace(&self) {
        self.lock().trace.clear();
    }

    // ── Session cleanup ─────────────────────────────────────

    /// Remove everything owned by a test session: its faults and its config
    /// overlay. The trace is left to the caller.
    pub fn remove_session(&self, session: &str) {
        let mut inner = self.lock();
        inner.faults.retain(|f| f.owner.as_deref() != Some(session));
        inner.session_config.retain(|(s, _), _| s != session);
    }
}

impl std::fmt::Debug for TestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("TestContext")
            .field("enabled", &self.is_enabled())
            .field("faults", &inner.faults.len())
            .field("counters", &inner.counters.len())
            .field("trace_len", &inner.trace.len())
            .finish()
    }
}
