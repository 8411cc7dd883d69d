//! Fault records and the builder used to arm them.
//!
//! A fault is (name, point, trigger, action). Faults are evaluated at the
//! named observation sites inside the framing driver and the method
//! invoker; the first matching active fault fires, its remaining count is
//! decremented, and a trace event is appended.

use std::sync::{Arc, Mutex};

use crate::error::{Result, SedError};

/// Named protocol observation sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// After the method tokens are encoded, before framing
    BeforeBuildMethod,
    /// Immediately before `Transport::if_send`
    BeforeIfSend,
    /// Immediately after `Transport::if_send` returns
    AfterIfSend,
    /// Immediately before `Transport::if_recv`
    BeforeIfRecv,
    /// After `Transport::if_recv`, before the ComPacket is unwrapped
    AfterIfRecv,
    /// After a method response is parsed
    AfterRecvMethod,
    /// After the raw Level 0 Discovery buffer is received, before parsing
    AfterDiscovery,
}

impl FaultPoint {
    /// Stable name used as the trace-event tag.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::BeforeBuildMethod => "before_build_method",
            Self::BeforeIfSend => "before_if_send",
            Self::AfterIfSend => "after_if_send",
            Self::BeforeIfRecv => "before_if_recv",
            Self::AfterIfRecv => "after_if_recv",
            Self::AfterRecvMethod => "after_recv_method",
            Self::AfterDiscovery => "after_discovery",
        }
    }
}

/// Callback fault body. Receives the in-flight buffer and may mutate it;
/// returning an error short-circuits the observed operation.
///
/// The contract forbids re-entering the owning `TestContext` from inside
/// the callback: the registry lock is released before the callback runs,
/// but mutating the registry mid-observation gives unspecified matching.
pub type FaultCallback = Arc<Mutex<Box<dyn FnMut(&mut Vec<u8>) -> Result<()> + Send>>>;

/// What an armed fault does when it fires.
#[derive(Clone)]
pub enum FaultAction {
    /// Short-circuit the observed operation with this error
    ReturnError(SedError),
    /// XOR one byte of the in-flight buffer
    CorruptByte {
        /// Offset into the buffer; out-of-range offsets do nothing
        offset: usize,
        /// Value XOR'd into the byte
        xor: u8,
    },
    /// Replace the in-flight buffer entirely
    ReplaceWith(Vec<u8>),
    /// Invoke a callback with the in-flight buffer
    Callback(FaultCallback),
}

impl std::fmt::Debug for FaultAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReturnError(e) => f.debug_tuple("ReturnError").field(e).finish(),
            Self::CorruptByte { offset, xor } => f
                .debug_struct("CorruptByte")
                .field("offset", offset)
                .field("xor", xor)
                .finish(),
            Self::ReplaceWith(b) => {
                f.debug_tuple("ReplaceWith").field(&format!("{} bytes", b.len())).finish()
            },
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// How often a fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTrigger {
    /// Fire on every hit
    Always,
    /// Fire at most this many more times
    Times(u32),
}

/// An armed fault in the registry.
///
/// A fault whose remaining count reaches zero is marked spent but stays in
/// the registry so its fire count remains inspectable until its owning
/// test session is dropped.
#[derive(Debug, Clone)]
pub struct Fault {
    /// Name the fault was armed under
    pub name: String,
    /// Observation site it is attached to
    pub point: FaultPoint,
    /// Optional scope label; a scoped fault only matches observations made
    /// with the same scope
    pub scope: Option<String>,
    /// Test session that armed it, for cleanup
    pub owner: Option<String>,
    /// Action applied when it fires
    pub action: FaultAction,
    /// Remaining trigger budget
    pub trigger: FaultTrigger,
    /// Times it has fired so far
    pub fired: u64,
    /// True once the trigger budget is exhausted
    pub spent: bool,
}

impl Fault {
    pub(crate) fn matches(&self, point: FaultPoint, scope: Option<&str>) -> bool {
        !self.spent
            && self.point == point
            && (self.scope.is_none() || self.scope.as_deref() == scope)
    }
}

/// Builder for arming faults.
///
/// ```
/// use sedframe_core::debug::{FaultBuilder, FaultPoint, TestContext};
/// use sedframe_core::SedError;
/// use sedframe_proto::MethodStatus;
///
/// let ctx = TestContext::new();
/// ctx.enable();
/// ctx.arm(
///     FaultBuilder::new("busy_3x")
///         .at(FaultPoint::AfterRecvMethod)
///         .return_error(SedError::MethodStatus(MethodStatus::SpBusy))
///         .times(3),
/// )
/// .unwrap();
/// ```
#[derive(Debug)]
pub struct FaultBuilder {
    name: String,
    point: Option<FaultPoint>,
    scope: Option<String>,
    action: Option<FaultAction>,
    trigger: FaultTrigger,
}

impl FaultBuilder {
    /// Start building a fault with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            point: None,
            scope: None,
            action: None,
            trigger: FaultTrigger::Always,
        }
    }

    /// Attach the fault to an observation site. Required.
    #[must_use]
    pub fn at(mut self, point: FaultPoint) -> Self {
        self.point = Some(point);
        self
    }

    /// Restrict matching to observations made with this scope label.
    #[must_use]
    pub fn scoped(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Fire by short-circuiting with the given error.
    #[must_use]
    pub fn return_error(mut self, error: SedError) -> Self {
        self.action = Some(FaultAction::ReturnError(error));
        self
    }

    /// Fire by short-circuiting with [`SedError::FaultInjected`] carrying
    /// this fault's name.
    #[must_use]
    pub fn fail(mut self) -> Self {
        self.action =
            Some(FaultAction::ReturnError(SedError::FaultInjected { name: self.name.clone() }));
        self
    }

    /// Fire by XOR-ing `xor` into the buffer byte at `offset`.
    #[must_use]
    pub fn corrupt(mut self, offset: usize, xor: u8) -> Self {
        self.action = Some(FaultAction::CorruptByte { offset, xor });
        self
    }

    /// Fire by replacing the in-flight buffer with `bytes`.
    #[must_use]
    pub fn replace_with(mut self, bytes: Vec<u8>) -> Self {
        self.action = Some(FaultAction::ReplaceWith(bytes));
        self
    }

    /// Fire by invoking `f` with the in-flight buffer.
    #[must_use]
    pub fn callback(
        mut self,
        f: impl FnMut(&mut Vec<u8>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.action = Some(FaultAction::Callback(Arc::new(Mutex::new(Box::new(f)))));
        self
    }

    /// Fire at most `n` times.
    #[must_use]
    pub fn times(mut self, n: u32) -> Self {
        self.trigger = FaultTrigger::Times(n);
        self
    }

    /// Fire exactly once; equivalent to `.times(1)`.
    #[must_use]
    pub fn once(self) -> Self {
        self.times(1)
    }

    /// Fire on every hit.
    #[must_use]
    pub fn always(mut self) -> Self {
        self.trigger = FaultTrigger::Always;
        self
    }

    pub(crate) fn build(self, owner: Option<String>) -> Result<Fault> {
        let point = self.point.ok_or_else(|| SedError::InvalidArgument {
            reason: format!("fault '{}' has no observation point", self.name),
        })?;
        let action = self.action.ok_or_else(|| SedError::InvalidArgument {
            reason: format!("fault '{}' has no action", self.name),
        })?;
        let spent = self.trigger == FaultTrigger::Times(0);
        Ok(Fault {
            name: self.name,
            point,
            scope: self.scope,
            owner,
            action,
            trigger: self.trigger,
            fired: 0,
            spent,
        })
    }
}
