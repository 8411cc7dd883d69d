//! Bounded pool of pre-opened sessions.
//!
//! Evaluation rigs that hammer a drive from many workers reuse a small set
//! of authenticated sessions instead of paying StartSession per job.
//! [`SessionPool::acquire`] blocks by polling (no condition variable, per
//! the engine's no-runtime design); the returned guard hands the session
//! back on drop if it is still open, and quietly drops it otherwise.

use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use sedframe_proto::Uid;

use crate::{
    auth::Credential,
    debug::TestContext,
    error::Result,
    session::Session,
    transport::SharedTransport,
};

/// Poll interval while waiting for an idle session.
const ACQUIRE_POLL: Duration = Duration::from_millis(1);

struct PoolShared {
    idle: Mutex<Vec<Session>>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, Vec<Session>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed-size pool of sessions opened against one SP and authority.
pub struct SessionPool {
    shared: Arc<PoolShared>,
    size: usize,
}

impl SessionPool {
    /// Open `size` authenticated sessions through the global test context.
    pub fn open(
        transport: &SharedTransport,
        com_id: u16,
        sp: Uid,
        authority: Uid,
        credential: &Credential,
        size: usize,
    ) -> Result<Self> {
        Self::open_with(transport, com_id, sp, authority, credential, size,
            &TestContext::global())
    }

    /// [`SessionPool::open`] against an explicit test context.
    pub fn open_with(
        transport: &SharedTransport,
        com_id: u16,
        sp: Uid,
        authority: Uid,
        credential: &Credential,
        size: usize,
        ctx: &Arc<TestContext>,
    ) -> Result<Self> {
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            let mut session =
                Session::with_context(Arc::clone(transport), com_id, Arc::clone(ctx));
            match session.start_with_auth(sp, true, authority, credential) {
                Ok(_) => idle.push(session),
                Err(e) => {
                    for mut s in idle {
                        let _ = s.close();
                    }
                    return Err(e);
                },
            }
        }
        tracing::debug!(size, sp = %sp, "session pool open");
        Ok(Self { shared: Arc::new(PoolShared { idle: Mutex::new(idle) }), size })
    }

    /// Number of sessions the pool was built with.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Sessions currently idle in the pool.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.shared.lock().len()
    }

    /// Take a session without blocking. `None` when all are checked out.
    #[must_use]
    pub fn try_acquire(&self) -> Option<PooledSession> {
        let session = self.shared.lock().pop()?;
        Some(PooledSession { session: Some(session), shared: Arc::clone(&self.shared) })
    }

    /// Take a session, blocking until one is idle.
    #[must_use]
    pub fn acquire(&self) -> PooledSession {
        loop {
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            thread::sleep(ACQUIRE_POLL);
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        for mut session in self.shared.lock().drain(..) {
            let _ = session.close();
        }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("size", &self.size)
            .field("idle", &self.idle())
            .finish()
    }
}

/// Exclusive loan of a pooled session.
///
/// Dereferences to [`Session`]. On drop the session returns to the pool if
/// it is still open; a session that died in the borrower's hands is
/// dropped instead of being handed to the next worker.
pub struct PooledSession {
    session: Option<Session>,
    shared: Arc<PoolShared>,
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        // INVARIANT: the slot is Some for the guard's whole lifetime; only
        // drop() takes it.
        self.session.as_ref().unwrap_or_else(|| unreachable!("pooled session taken before drop"))
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().unwrap_or_else(|| unreachable!("pooled session taken before drop"))
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if session.is_open() {
                self.shared.lock().push(session);
            } else {
                tracing::debug!(hsn = session.hsn(), "dropping dead pooled session");
            }
        }
    }
}
