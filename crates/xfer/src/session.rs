//! Transfer session
//!
//! A [`Session`] is the explicit context every entry point takes: it owns the
//! background [`EventThread`] and the behavior options. Clones share one
//! session. Transfer contexts keep their session alive, so the event thread
//! is torn down only after the last clone and the last context are gone (or
//! earlier, by [`Session::shutdown`]).

use crate::driver::EventDispatch;
use crate::error::Result;
use crate::event_thread::{DEFAULT_POLL_INTERVAL, EventThread, EventThreadState};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Upper bound on one driver poll and on one idle wait
    pub poll_interval: Duration,
    /// Report a timed out or cancelled transfer that moved data as a short
    /// success instead of a timeout
    pub short_read_on_timeout: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            short_read_on_timeout: true,
        }
    }
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    events: Arc<EventThread>,
    options: SessionOptions,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        debug!("Last session holder released");
        self.events.stop();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("options", &self.inner.options)
            .field("events", &self.inner.events)
            .finish()
    }
}

impl Session {
    pub fn new(dispatch: Arc<dyn EventDispatch>, options: SessionOptions) -> Self {
        let events = Arc::new(EventThread::new(dispatch, options.poll_interval));
        Self {
            inner: Arc::new(SessionInner { events, options }),
        }
    }

    pub fn options(&self) -> SessionOptions {
        self.inner.options
    }

    pub fn short_read_on_timeout(&self) -> bool {
        self.inner.options.short_read_on_timeout
    }

    pub fn event_thread(&self) -> &EventThread {
        &self.inner.events
    }

    pub fn event_state(&self) -> EventThreadState {
        self.inner.events.state()
    }

    /// Start background polling; async context setup does this implicitly
    pub fn start_events(&self) -> Result<()> {
        self.inner.events.start()
    }

    /// Stop background polling now
    ///
    /// Transfers still in flight will not complete until polling is started
    /// again.
    pub fn shutdown(&self) {
        self.inner.events.stop();
    }
}
