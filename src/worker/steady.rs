//! One-shot steady latch.
//!
//! "Steady" means the worker has caught up to the ops log tail since it
//! started. The latch completes exactly once, either `Ready` or
//! `Failed`, and never reverses.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::MapError;

#[derive(Clone, Debug, Default)]
pub enum SteadyState {
    #[default]
    Pending,
    Ready,
    Failed(MapError),
}

impl SteadyState {
    pub fn is_complete(&self) -> bool {
        !matches!(self, SteadyState::Pending)
    }
}

/// Completion side, owned by the worker.
#[derive(Clone, Default)]
pub struct SteadyLatch {
    inner: Arc<Inner>,
}

/// Observer side handed to external callers.
#[derive(Clone)]
pub struct SteadyHandle {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<SteadyState>,
    completed: Condvar,
}

impl SteadyLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> SteadyHandle {
        SteadyHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// `Pending -> Ready`. Returns `true` iff this call made the
    /// transition.
    pub fn complete(&self) -> bool {
        self.inner.transition(SteadyState::Ready)
    }

    /// `Pending -> Failed`. Returns `true` iff this call made the
    /// transition; a completed latch is left untouched.
    pub fn fail(&self, err: MapError) -> bool {
        self.inner.transition(SteadyState::Failed(err))
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().is_complete()
    }
}

impl SteadyHandle {
    pub fn state(&self) -> SteadyState {
        self.inner.lock().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().is_complete()
    }

    /// Blocks until the latch completes.
    pub fn wait(&self) -> Result<(), MapError> {
        let mut state = self.inner.lock();
        loop {
            match &*state {
                SteadyState::Pending => {
                    state = self
                        .inner
                        .completed
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
                SteadyState::Ready => return Ok(()),
                SteadyState::Failed(err) => return Err(err.clone()),
            }
        }
    }

    /// Blocks up to `timeout`; `None` means still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), MapError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        loop {
            match &*state {
                SteadyState::Pending => {}
                SteadyState::Ready => return Some(Ok(())),
                SteadyState::Failed(err) => return Some(Err(err.clone())),
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .inner
                .completed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SteadyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, next: SteadyState) -> bool {
        let mut state = self.lock();
        if state.is_complete() {
            return false;
        }
        *state = next;
        drop(state);
        self.completed.notify_all();
        true
    }
}
