//! # Timer Core
//!
//! One unified wake-up time drives every time-driven transition: the
//! source's SPM schedule and rate-deferred RDATA, and each peer's SPMR,
//! NAK ladder, and expiry. The driver (a dedicated thread or a caller-owned
//! reactor) sleeps until the earliest deadline or an explicit notification,
//! then runs the tick.

use quanta::Instant;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Outcome of one [`TimerCore::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The deadline passed: run the tick.
    Deadline,
    /// Another thread rescheduled or produced work: recompute.
    Notified,
    /// The transport is shutting down.
    Shutdown,
}

#[derive(Debug, Default)]
struct TimerState {
    notified: bool,
    shutdown: bool,
}

/// Condvar-based wake-up shared by the timer driver and blocked readers.
#[derive(Debug, Default)]
pub struct TimerCore {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl TimerCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter: an earlier expiry was installed or data arrived.
    pub fn notify(&self) {
        let mut state = self.state.lock().expect("timer lock");
        state.notified = true;
        self.cond.notify_all();
    }

    /// Signal shutdown and wake every waiter.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("timer lock");
        state.shutdown = true;
        self.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().expect("timer lock").shutdown
    }

    /// Sleep until `deadline` (relative to `now`), a notification, or
    /// shutdown — whichever comes first.
    pub fn wait(&self, now: Instant, deadline: Instant) -> WaitOutcome {
        let timeout = deadline.saturating_duration_since(now);
        let mut state = self.state.lock().expect("timer lock");
        if state.shutdown {
            return WaitOutcome::Shutdown;
        }
        if state.notified {
            state.notified = false;
            return WaitOutcome::Notified;
        }
        if timeout.is_zero() {
            return WaitOutcome::Deadline;
        }
        let (mut state, wait) = self
            .cond
            .wait_timeout(state, timeout)
            .expect("timer lock");
        if state.shutdown {
            WaitOutcome::Shutdown
        } else if state.notified {
            state.notified = false;
            WaitOutcome::Notified
        } else if wait.timed_out() {
            WaitOutcome::Deadline
        } else {
            // Spurious wake: treat as a notification so the caller
            // recomputes its deadline.
            WaitOutcome::Notified
        }
    }
}

/// The earliest of the source schedule and any peer deadline.
pub fn next_expiry(source_next: Instant, receiver_next: Option<Instant>) -> Instant {
    match receiver_next {
        Some(receiver) if receiver < source_next => receiver,
        _ => source_next,
    }
}

/// Clamp a deadline so a driver never oversleeps a late-arriving peer.
pub fn bounded_sleep(now: Instant, deadline: Instant, max_sleep: Duration) -> Instant {
    let cap = now + max_sleep;
    if deadline < cap {
        deadline
    } else {
        cap
    }
}
