//! Blocking synchronization primitives
//!
//! [`Event`] is a signal that threads can wait on with an optional timeout,
//! in either auto-reset (one waiter consumes the signal) or manual-reset
//! (signal stays set until [`Event::reset`]) flavor. [`Semaphore`] is a
//! bounded counting semaphore.
//!
//! Lock poisoning is recovered from: the guarded state is a plain flag or
//! counter and cannot be left half-updated by a panicking holder.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How an [`Event`] behaves after releasing a waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// A successful wait consumes the signal
    AutoReset,
    /// The signal stays set until explicitly reset
    ManualReset,
}

/// A waitable boolean signal
#[derive(Debug)]
pub struct Event {
    mode: EventMode,
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new(mode: EventMode, initially_set: bool) -> Self {
        Self {
            mode,
            signaled: Mutex::new(initially_set),
            cond: Condvar::new(),
        }
    }

    /// Unsignaled auto-reset event
    pub fn auto_reset() -> Self {
        Self::new(EventMode::AutoReset, false)
    }

    /// Unsignaled manual-reset event
    pub fn manual_reset() -> Self {
        Self::new(EventMode::ManualReset, false)
    }

    pub fn mode(&self) -> EventMode {
        self.mode
    }

    /// Signal the event, waking one waiter (auto-reset) or all (manual-reset)
    pub fn set(&self) {
        let mut signaled = lock(&self.signaled);
        *signaled = true;
        match self.mode {
            EventMode::AutoReset => self.cond.notify_one(),
            EventMode::ManualReset => self.cond.notify_all(),
        }
    }

    pub fn reset(&self) {
        *lock(&self.signaled) = false;
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.signaled)
    }

    /// Wait for the event to become signaled
    ///
    /// `None` waits forever. Returns `false` if the timeout elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let guard = lock(&self.signaled);
        let mut guard = match timeout {
            None => self
                .cond
                .wait_while(guard, |signaled| !*signaled)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                let (guard, _) = self
                    .cond
                    .wait_timeout_while(guard, timeout, |signaled| !*signaled)
                    .unwrap_or_else(PoisonError::into_inner);
                guard
            }
        };

        if !*guard {
            return false;
        }
        if self.mode == EventMode::AutoReset {
            *guard = false;
        }
        true
    }
}

/// Counting semaphore with an upper bound
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<usize>,
    max: usize,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize, max: usize) -> Self {
        Self {
            count: Mutex::new(initial.min(max)),
            max,
            cond: Condvar::new(),
        }
    }

    pub fn count(&self) -> usize {
        *lock(&self.count)
    }

    /// Take one unit, blocking up to `timeout` (`None` = forever)
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let guard = lock(&self.count);
        let mut guard = match timeout {
            None => self
                .cond
                .wait_while(guard, |count| *count == 0)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                let (guard, _) = self
                    .cond
                    .wait_timeout_while(guard, timeout, |count| *count == 0)
                    .unwrap_or_else(PoisonError::into_inner);
                guard
            }
        };

        if *guard == 0 {
            return false;
        }
        *guard -= 1;
        true
    }

    pub fn try_wait(&self) -> bool {
        let mut count = lock(&self.count);
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Return one unit. Returns `false` (and changes nothing) at the bound.
    pub fn release(&self) -> bool {
        let mut count = lock(&self.count);
        if *count >= self.max {
            return false;
        }
        *count += 1;
        self.cond.notify_one();
        true
    }
}
