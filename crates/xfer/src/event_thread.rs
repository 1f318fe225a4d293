//! Background event polling
//!
//! One thread per [`crate::Session`] owns the driver's event lock and
//! dispatches completions. It polls only while at least one transfer is in
//! flight (the fly count); otherwise it parks on the `running` signal so an
//! idle session costs nothing.
//!
//! ```text
//! Stopped --start--> Starting --> Idle <--> Active
//!    ^                                |
//!    +-------------- stop ------------+
//! ```

use crate::driver::EventDispatch;
use crate::error::{DriverError, Result, TransferError};
use common::Event;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Default upper bound on a single poll or idle wait
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventThreadState {
    Stopped = 0,
    Starting = 1,
    /// Waiting for a transfer to be submitted
    Idle = 2,
    /// Polling the driver for completions
    Active = 3,
}

impl EventThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EventThreadState::Starting,
            2 => EventThreadState::Idle,
            3 => EventThreadState::Active,
            _ => EventThreadState::Stopped,
        }
    }
}

pub struct EventThread {
    dispatch: Arc<dyn EventDispatch>,
    poll_interval: Duration,
    state: AtomicU8,
    stop_requested: AtomicBool,
    fly_count: AtomicI32,
    running: Event,
    terminated: Event,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventThread")
            .field("state", &self.state())
            .field("fly_count", &self.fly_count())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Sets `terminated` when the poll loop exits, even by panic
struct TerminatedGuard<'a>(&'a EventThread);

impl Drop for TerminatedGuard<'_> {
    fn drop(&mut self) {
        self.0.set_state(EventThreadState::Stopped);
        self.0.terminated.set();
    }
}

impl EventThread {
    pub fn new(dispatch: Arc<dyn EventDispatch>, poll_interval: Duration) -> Self {
        Self {
            dispatch,
            poll_interval,
            state: AtomicU8::new(EventThreadState::Stopped as u8),
            stop_requested: AtomicBool::new(false),
            fly_count: AtomicI32::new(0),
            running: Event::manual_reset(),
            terminated: Event::manual_reset(),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EventThreadState {
        EventThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EventThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Number of transfers currently submitted or being reaped
    pub fn fly_count(&self) -> i32 {
        self.fly_count.load(Ordering::Acquire)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn is_started(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start the polling thread; a no-op if it is already running
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return Ok(());
        }

        self.set_state(EventThreadState::Starting);
        self.stop_requested.store(false, Ordering::Release);
        self.terminated.reset();
        if self.fly_count() == 0 {
            self.running.reset();
        }

        let this = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || this.run());

        match spawned {
            Ok(join) => {
                *handle = Some(join);
                debug!("Event thread started");
                Ok(())
            }
            Err(e) => {
                self.set_state(EventThreadState::Stopped);
                error!("Failed to spawn event thread: {}", e);
                Err(TransferError::ThreadSpawn(e))
            }
        }
    }

    /// Stop the polling thread and wait for it to exit
    pub fn stop(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(join) = handle.take() else {
            return;
        };

        self.stop_requested.store(true, Ordering::Release);
        self.running.set();

        // The thread calls stop() on itself only if the last session holder
        // is dropped from a completion callback; it is exiting anyway.
        if join.thread().id() == std::thread::current().id() {
            warn!("Event thread stopped from its own completion callback");
            return;
        }

        self.terminated.wait(None);
        if join.join().is_err() {
            error!("Event thread panicked");
        }
        self.running.reset();
        self.set_state(EventThreadState::Stopped);
        debug!("Event thread stopped");
    }

    /// Record a transfer entering flight; wakes the thread on 0 -> 1
    pub(crate) fn transfer_started(&self) {
        if self.fly_count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.running.set();
        }
    }

    /// Record a transfer leaving flight; idles the thread on 1 -> 0
    pub(crate) fn transfer_finished(&self) {
        let previous = self.fly_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.running.reset();
            // A concurrent transfer_started may have set the signal between
            // our decrement and the reset.
            if self.fly_count.load(Ordering::Acquire) > 0 {
                self.running.set();
            }
        } else if previous <= 0 {
            error!("Fly count dropped below zero ({})", previous - 1);
        }
    }

    fn run(&self) {
        let _terminated = TerminatedGuard(self);
        info!("Event thread running");

        while !self.stop_requested.load(Ordering::Acquire) {
            self.dispatch.lock_events();

            if self.fly_count() == 0 {
                self.set_state(EventThreadState::Idle);
                self.dispatch.unlock_events();
                self.running.wait(Some(self.poll_interval));
                continue;
            }

            if !self.dispatch.event_handling_ok() {
                self.dispatch.unlock_events();
                std::thread::yield_now();
                continue;
            }

            self.set_state(EventThreadState::Active);
            match self.dispatch.handle_events_locked(self.poll_interval) {
                Ok(()) => {}
                Err(DriverError::Interrupted) => {
                    trace!("Event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                }
            }
            self.dispatch.unlock_events();
        }

        info!("Event thread exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockEvents;
    use std::time::Instant;

    fn wait_for(thread: &EventThread, state: EventThreadState, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if thread.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        thread.state() == state
    }

    fn spawn(interval: Duration) -> (Arc<MockEvents>, Arc<EventThread>) {
        let events = Arc::new(MockEvents::new());
        let thread = Arc::new(EventThread::new(events.clone(), interval));
        (events, thread)
    }

    #[test]
    fn test_start_is_idempotent() {
        let (_events, thread) = spawn(Duration::from_millis(20));
        thread.start().unwrap();
        thread.start().unwrap();
        assert!(thread.is_started());
        assert!(wait_for(&thread, EventThreadState::Idle, Duration::from_secs(2)));
        thread.stop();
        assert_eq!(thread.state(), EventThreadState::Stopped);
        assert!(!thread.is_started());
    }

    #[test]
    fn test_stop_without_start() {
        let (_events, thread) = spawn(Duration::from_millis(20));
        thread.stop();
        assert_eq!(thread.state(), EventThreadState::Stopped);
    }

    #[test]
    fn test_restart_after_stop() {
        let (_events, thread) = spawn(Duration::from_millis(20));
        thread.start().unwrap();
        thread.stop();
        thread.start().unwrap();
        assert!(wait_for(&thread, EventThreadState::Idle, Duration::from_secs(2)));
        thread.stop();
    }

    #[test]
    fn test_polls_only_while_in_flight() {
        let (events, thread) = spawn(Duration::from_millis(10));
        thread.start().unwrap();
        assert!(wait_for(&thread, EventThreadState::Idle, Duration::from_secs(2)));
        assert_eq!(events.poll_count(), 0);

        thread.transfer_started();
        assert!(wait_for(&thread, EventThreadState::Active, Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(events.poll_count() > 0);

        thread.transfer_finished();
        // Idle within one poll interval (plus scheduling slack)
        assert!(wait_for(&thread, EventThreadState::Idle, Duration::from_millis(500)));
        let polls = events.poll_count();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(events.poll_count(), polls);

        thread.stop();
    }

    #[test]
    fn test_fly_count_tracking() {
        let (_events, thread) = spawn(Duration::from_millis(10));
        thread.transfer_started();
        thread.transfer_started();
        assert_eq!(thread.fly_count(), 2);
        thread.transfer_finished();
        thread.transfer_finished();
        assert_eq!(thread.fly_count(), 0);
    }
}
