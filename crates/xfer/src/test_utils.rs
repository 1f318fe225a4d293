//! Test utilities for the transfer engine
//!
//! [`MockEvents`] and [`MockDevice`] stand in for libusb. Completions are
//! queued by the mock device and only delivered when the event thread polls
//! [`MockEvents`], so tests exercise the same hand-off path as real
//! hardware.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use xfer::test_utils::{MockDevice, MockEvents};
//! use xfer::{Session, SessionOptions, TransferContext};
//!
//! let events = Arc::new(MockEvents::new());
//! let device = Arc::new(MockDevice::new(&events));
//! let session = Session::new(events, SessionOptions::default());
//!
//! let ctx = TransferContext::bulk(&session, device, 0x81).unwrap();
//! ctx.submit(vec![0u8; 512], 512, Duration::from_secs(1)).unwrap();
//! assert_eq!(ctx.reap(Some(Duration::from_secs(1)), false).unwrap(), 512);
//! ```

use crate::driver::{
    Completion, CompletionSink, DeviceIo, ENDPOINT_IN, EventDispatch, IsoLayout, RawOutcome,
    RawTransfer, SubmitError, SubmitRequest, TransferSetup,
};
use crate::error::{DriverError, TransferStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Delivery = (Arc<dyn CompletionSink>, Completion);

#[derive(Default)]
struct CompletionQueue {
    pending: Mutex<VecDeque<Delivery>>,
    ready: Condvar,
}

impl CompletionQueue {
    fn push(&self, sink: Arc<dyn CompletionSink>, completion: Completion) {
        lock(&self.pending).push_back((sink, completion));
        self.ready.notify_all();
    }
}

/// Event loop that delivers completions queued by [`MockDevice`]
#[derive(Default)]
pub struct MockEvents {
    queue: Arc<CompletionQueue>,
    polls: AtomicUsize,
    locked: AtomicBool,
}

impl MockEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `handle_events_locked` calls so far
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Completions queued but not yet delivered
    pub fn pending(&self) -> usize {
        lock(&self.queue.pending).len()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

impl EventDispatch for MockEvents {
    fn lock_events(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    fn unlock_events(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    fn event_handling_ok(&self) -> bool {
        true
    }

    fn handle_events_locked(&self, timeout: Duration) -> Result<(), DriverError> {
        self.polls.fetch_add(1, Ordering::SeqCst);

        let ready: Vec<Delivery> = {
            let pending = lock(&self.queue.pending);
            let (mut pending, _) = self
                .queue
                .ready
                .wait_timeout_while(pending, timeout, |pending| pending.is_empty())
                .unwrap_or_else(PoisonError::into_inner);
            pending.drain(..).collect()
        };

        for (sink, completion) in ready {
            sink.complete(completion);
        }
        Ok(())
    }
}

/// How a [`MockDevice`] endpoint answers asynchronous submissions
#[derive(Clone)]
pub enum EndpointBehavior {
    /// Complete with the full requested length
    CompleteFull,
    /// Complete with at most this many bytes
    CompleteShort(usize),
    /// Fill the first `length` bytes and complete with the returned count
    CompleteWith(Arc<dyn Fn(&mut [u8]) -> usize + Send + Sync>),
    /// Stay in flight until cancelled, then complete as cancelled with 0 bytes
    NeverComplete,
    /// Stay in flight until cancelled, then complete as cancelled with this
    /// many bytes
    CancelledAfter(usize),
    /// Complete with this status and 0 bytes
    Fail(TransferStatus),
    /// Refuse the submission
    RejectSubmit(DriverError),
}

impl std::fmt::Debug for EndpointBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointBehavior::CompleteFull => f.write_str("CompleteFull"),
            EndpointBehavior::CompleteShort(n) => write!(f, "CompleteShort({})", n),
            EndpointBehavior::CompleteWith(_) => f.write_str("CompleteWith(..)"),
            EndpointBehavior::NeverComplete => f.write_str("NeverComplete"),
            EndpointBehavior::CancelledAfter(n) => write!(f, "CancelledAfter({})", n),
            EndpointBehavior::Fail(status) => write!(f, "Fail({:?})", status),
            EndpointBehavior::RejectSubmit(e) => write!(f, "RejectSubmit({:?})", e),
        }
    }
}

/// How a [`MockDevice`] answers synchronous bulk/interrupt calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncBehavior {
    Complete,
    /// Time out after moving this many bytes
    TimeoutAfter(usize),
    Fail(DriverError),
}

/// One submission as seen by the mock device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedRequest {
    pub length: usize,
    pub timeout: Duration,
    pub iso: Option<IsoLayout>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

struct DeviceState {
    behaviors: Mutex<HashMap<u8, EndpointBehavior>>,
    requests: Mutex<HashMap<u8, Vec<RecordedRequest>>>,
    allocations: AtomicUsize,
    frees: AtomicUsize,
    cancels: AtomicUsize,
    fail_allocations: AtomicBool,
    last_setup: Mutex<Option<TransferSetup>>,
    sync_behavior: Mutex<SyncBehavior>,
    last_sync_endpoint: Mutex<Option<u8>>,
    control_response: Mutex<Vec<u8>>,
    control_error: Mutex<Option<DriverError>>,
    control_requests: Mutex<Vec<ControlRequest>>,
}

/// Scripted device
///
/// Endpoints default to [`EndpointBehavior::CompleteFull`].
pub struct MockDevice {
    queue: Arc<CompletionQueue>,
    state: Arc<DeviceState>,
}

impl MockDevice {
    /// Device whose completions are delivered by `events`
    pub fn new(events: &MockEvents) -> Self {
        Self {
            queue: Arc::clone(&events.queue),
            state: Arc::new(DeviceState {
                behaviors: Mutex::new(HashMap::new()),
                requests: Mutex::new(HashMap::new()),
                allocations: AtomicUsize::new(0),
                frees: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                fail_allocations: AtomicBool::new(false),
                last_setup: Mutex::new(None),
                sync_behavior: Mutex::new(SyncBehavior::Complete),
                last_sync_endpoint: Mutex::new(None),
                control_response: Mutex::new(Vec::new()),
                control_error: Mutex::new(None),
                control_requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_behavior(&self, endpoint: u8, behavior: EndpointBehavior) {
        lock(&self.state.behaviors).insert(endpoint, behavior);
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.state.fail_allocations.store(fail, Ordering::SeqCst);
    }

    pub fn set_sync_behavior(&self, behavior: SyncBehavior) {
        *lock(&self.state.sync_behavior) = behavior;
    }

    /// Bytes copied into IN control transfers
    pub fn set_control_response(&self, data: &[u8]) {
        *lock(&self.state.control_response) = data.to_vec();
    }

    pub fn set_control_error(&self, error: Option<DriverError>) {
        *lock(&self.state.control_error) = error;
    }

    pub fn allocations(&self) -> usize {
        self.state.allocations.load(Ordering::SeqCst)
    }

    /// Transfer handles dropped so far
    pub fn frees(&self) -> usize {
        self.state.frees.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.state.cancels.load(Ordering::SeqCst)
    }

    pub fn last_setup(&self) -> Option<TransferSetup> {
        *lock(&self.state.last_setup)
    }

    pub fn submissions(&self, endpoint: u8) -> usize {
        lock(&self.state.requests)
            .get(&endpoint)
            .map_or(0, |requests| requests.len())
    }

    pub fn last_request(&self, endpoint: u8) -> Option<RecordedRequest> {
        lock(&self.state.requests)
            .get(&endpoint)
            .and_then(|requests| requests.last().copied())
    }

    pub fn last_sync_endpoint(&self) -> Option<u8> {
        *lock(&self.state.last_sync_endpoint)
    }

    pub fn control_requests(&self) -> Vec<ControlRequest> {
        lock(&self.state.control_requests).clone()
    }

    fn sync_transfer(&self, endpoint: u8, len: usize) -> RawOutcome {
        *lock(&self.state.last_sync_endpoint) = Some(endpoint);
        match *lock(&self.state.sync_behavior) {
            SyncBehavior::Complete => RawOutcome {
                result: Ok(()),
                actual_length: len,
            },
            SyncBehavior::TimeoutAfter(n) => RawOutcome {
                result: Err(DriverError::Timeout),
                actual_length: n.min(len),
            },
            SyncBehavior::Fail(e) => RawOutcome {
                result: Err(e),
                actual_length: 0,
            },
        }
    }
}

impl DeviceIo for MockDevice {
    fn alloc_transfer(&self, setup: &TransferSetup) -> Result<Box<dyn RawTransfer>, DriverError> {
        if self.state.fail_allocations.load(Ordering::SeqCst) {
            return Err(DriverError::NoMem);
        }
        self.state.allocations.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state.last_setup) = Some(*setup);
        Ok(Box::new(MockTransfer {
            endpoint: setup.endpoint,
            queue: Arc::clone(&self.queue),
            state: Arc::clone(&self.state),
            in_flight: Mutex::new(None),
        }))
    }

    fn read_bulk(&self, endpoint: u8, data: &mut [u8], _timeout: Duration) -> RawOutcome {
        self.sync_transfer(endpoint, data.len())
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> RawOutcome {
        self.sync_transfer(endpoint, data.len())
    }

    fn read_interrupt(&self, endpoint: u8, data: &mut [u8], _timeout: Duration) -> RawOutcome {
        self.sync_transfer(endpoint, data.len())
    }

    fn write_interrupt(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> RawOutcome {
        self.sync_transfer(endpoint, data.len())
    }

    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, DriverError> {
        lock(&self.state.control_requests).push(ControlRequest {
            request_type,
            request,
            value,
            index,
        });
        if let Some(e) = *lock(&self.state.control_error) {
            return Err(e);
        }
        if request_type & ENDPOINT_IN == 0 {
            return Ok(data.len());
        }
        let response = lock(&self.state.control_response);
        let n = response.len().min(data.len());
        data[..n].copy_from_slice(&response[..n]);
        Ok(n)
    }
}

/// Submission parked until cancelled: sink, buffer, bytes to report
type Parked = (Arc<dyn CompletionSink>, Vec<u8>, usize);

struct MockTransfer {
    endpoint: u8,
    queue: Arc<CompletionQueue>,
    state: Arc<DeviceState>,
    in_flight: Mutex<Option<Parked>>,
}

impl RawTransfer for MockTransfer {
    fn submit(
        &mut self,
        request: SubmitRequest,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<(), SubmitError> {
        let behavior = lock(&self.state.behaviors)
            .get(&self.endpoint)
            .cloned()
            .unwrap_or(EndpointBehavior::CompleteFull);

        if let EndpointBehavior::RejectSubmit(error) = behavior {
            return Err(SubmitError {
                error,
                buffer: request.buffer,
            });
        }

        lock(&self.state.requests)
            .entry(self.endpoint)
            .or_default()
            .push(RecordedRequest {
                length: request.length,
                timeout: request.timeout,
                iso: request.iso,
            });

        let length = request.length;
        let mut buffer = request.buffer;
        let (status, actual_length) = match behavior {
            EndpointBehavior::CompleteFull => (TransferStatus::Completed, length),
            EndpointBehavior::CompleteShort(n) => (TransferStatus::Completed, n.min(length)),
            EndpointBehavior::CompleteWith(fill) => {
                let n = fill(&mut buffer[..length]);
                (TransferStatus::Completed, n.min(length))
            }
            EndpointBehavior::Fail(status) => (status, 0),
            EndpointBehavior::NeverComplete => {
                *lock(&self.in_flight) = Some((sink, buffer, 0));
                return Ok(());
            }
            EndpointBehavior::CancelledAfter(n) => {
                *lock(&self.in_flight) = Some((sink, buffer, n.min(length)));
                return Ok(());
            }
            EndpointBehavior::RejectSubmit(_) => unreachable!("handled above"),
        };

        self.queue.push(
            sink,
            Completion {
                status,
                actual_length,
                buffer,
            },
        );
        Ok(())
    }

    fn cancel(&self) -> Result<(), DriverError> {
        self.state.cancels.fetch_add(1, Ordering::SeqCst);
        let Some((sink, buffer, actual_length)) = lock(&self.in_flight).take() else {
            return Err(DriverError::NotFound);
        };
        self.queue.push(
            sink,
            Completion {
                status: TransferStatus::Cancelled,
                actual_length,
                buffer,
            },
        );
        Ok(())
    }
}

impl Drop for MockTransfer {
    fn drop(&mut self) {
        self.state.frees.fetch_add(1, Ordering::SeqCst);
    }
}
