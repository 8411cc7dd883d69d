//! Scoped test-session lifetimes under a [`TestContext`].

use std::{collections::HashMap, sync::Arc};

use super::{ConfigValue, FaultBuilder, TestContext, TraceEvent};
use crate::error::Result;

/// A named scope over a [`TestContext`].
///
/// Faults armed through a `TestSession` and config it sets are removed when
/// the session is dropped; counters are reported relative to a snapshot
/// taken at construction, which gives each session its own view of the
/// context-global counters.
///
/// The trace ring is cleared on drop unless [`TestSession::retain_trace`]
/// was called.
pub struct TestSession {
    name: String,
    ctx: Arc<TestContext>,
    baseline: HashMap<String, u64>,
    global_keys: Vec<String>,
    retain_trace: bool,
}

impl TestSession {
    /// Open a scope on the process-wide context.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_context(name, TestContext::global())
    }

    /// Open a scope on an explicit context.
    #[must_use]
    pub fn with_context(name: impl Into<String>, ctx: Arc<TestContext>) -> Self {
        let baseline = ctx.counters();
        Self { name: name.into(), ctx, baseline, global_keys: Vec::new(), retain_trace: false }
    }

    /// The scope's unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The context this scope lives under.
    #[must_use]
    pub fn context(&self) -> &Arc<TestContext> {
        &self.ctx
    }

    /// Arm a fault owned by this scope; it is disarmed on drop.
    pub fn fault(&self, builder: FaultBuilder) -> Result<()> {
        self.ctx.arm_owned(builder, Some(self.name.clone()))
    }

    /// Activate a named workaround flag for the duration of this scope.
    pub fn workaround(&mut self, flag: &str) {
        self.ctx.set_global_config(flag, ConfigValue::Bool(true));
        self.global_keys.push(flag.to_string());
    }

    /// Set a value in this scope's config overlay.
    pub fn config(&self, name: impl Into<String>, value: impl Into<ConfigValue>) {
        self.ctx.set_session_config(self.name.clone(), name, value.into());
    }

    /// Set a global config value for the duration of this scope.
    pub fn global_config(&mut self, name: &str, value: impl Into<ConfigValue>) {
        self.ctx.set_global_config(name, value.into());
        self.global_keys.push(name.to_string());
    }

    /// A counter's value accumulated since this scope opened.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        let base = self.baseline.get(name).copied().unwrap_or(0);
        self.ctx.counter(name).saturating_sub(base)
    }

    /// Snapshot of the context trace ring.
    #[must_use]
    pub fn trace(&self) -> Vec<TraceEvent> {
        self.ctx.trace()
    }

    /// Keep the trace ring when this scope is dropped.
    pub fn retain_trace(&mut self) {
        self.retain_trace = true;
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        self.ctx.remove_session(&self.name);
        for key in &self.global_keys {
            self.ctx.remove_global_config(key);
        }
        if !self.retain_trace {
            self.ctx.clear_trace();
        }
    }
}

impl std::fmt::Debug for TestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestSession").field("name", &self.name).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::{FaultPoint, counter, workaround};

    #[test]
    fn scope_exit_removes_faults_and_flags() {
        let ctx = Arc::new(TestContext::new());
        ctx.enable();

        {
            let mut ts = TestSession::with_context("scope", Arc::clone(&ctx));
            ts.fault(FaultBuilder::new("f").at(FaultPoint::BeforeIfSend).fail().always())
                .unwrap();
            ts.workaround(workaround::RETRY_ON_SP_BUSY);
            assert!(ctx.workaround_active(workaround::RETRY_ON_SP_BUSY));

            let mut buf = Vec::new();
            assert!(ctx.observe(FaultPoint::BeforeIfSend, &mut buf).is_err());
        }

        let mut buf = Vec::new();
        assert!(ctx.observe(FaultPoint::BeforeIfSend, &mut buf).is_ok());
        assert!(!ctx.workaround_active(workaround::RETRY_ON_SP_BUSY));
    }

    #[test]
    fn counters_are_relative_to_scope_start() {
        let ctx = Arc::new(TestContext::new());
        ctx.enable();
        ctx.bump(counter::TRANSPORT_SEND);
        ctx.bump(counter::TRANSPORT_SEND);

        let ts = TestSession::with_context("s", Arc::clone(&ctx));
        assert_eq!(ts.counter(counter::TRANSPORT_SEND), 0);
        ctx.bump(counter::TRANSPORT_SEND);
        assert_eq!(ts.counter(counter::TRANSPORT_SEND), 1);
        assert_eq!(ctx.counter(counter::TRANSPORT_SEND), 3);
    }

    #[test]
    fn session_config_overlay_is_scoped() {
        let ctx = Arc::new(TestContext::new());
        let ts = TestSession::with_context("slow_enterprise", Arc::clone(&ctx));
        ts.config("timeout_extend_ms", 120_000u64);
        assert_eq!(
            ctx.config_u64("timeout_extend_ms", Some("slow_enterprise")),
            Some(120_000)
        );
        drop(ts);
        assert_eq!(ctx.config_u64("timeout_extend_ms", Some("slow_enterprise")), None);
    }
}
