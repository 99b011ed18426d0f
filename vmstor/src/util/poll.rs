//! Deadline-bounded polling with cooperative cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use vmstor_shared::errors::{VmstorError, VmstorResult};

/// Shared cancellation flag. Cloning yields a handle to the same flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and wake every waiter.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock() = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `dur` unless cancelled first. Returns true if cancelled.
    fn sleep(&self, dur: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock();
        if *cancelled {
            return true;
        }
        let deadline = Instant::now() + dur;
        while !*cancelled {
            if cvar.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The condition held before the deadline.
    Done,
    /// The deadline passed with the condition still false.
    TimedOut,
}

/// Re-evaluate a condition at a fixed tick until it holds or a deadline passes.
pub struct BoundedPoll {
    interval: Duration,
    budget: Duration,
    cancel: CancelToken,
}

impl BoundedPoll {
    pub fn new(interval: Duration, budget: Duration) -> Self {
        Self {
            interval,
            budget,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sleep one tick, then check `done`; repeat while budget remains.
    ///
    /// The condition is never checked before the first tick. A zero budget
    /// therefore times out without checking.
    pub fn run<F>(&self, mut done: F) -> VmstorResult<PollOutcome>
    where
        F: FnMut() -> VmstorResult<bool>,
    {
        let deadline = Instant::now() + self.budget;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(PollOutcome::TimedOut);
            }
            let tick = self.interval.min(deadline - now);
            if self.cancel.sleep(tick) {
                return Err(VmstorError::Cancelled(
                    "poll interrupted before condition was met".to_string(),
                ));
            }
            if done()? {
                return Ok(PollOutcome::Done);
            }
        }
    }
}
