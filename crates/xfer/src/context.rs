//! Transfer contexts
//!
//! A [`TransferContext`] pairs one low-level transfer handle with a
//! completion signal. It is created once per endpoint slot and reused for
//! many submit/reap cycles.
//!
//! Lifetime is guarded by a reference count on top of the `Arc`:
//!
//! - the owning [`TransferContext`] holds one reference from creation until
//!   [`TransferContext::free`] (or drop)
//! - a submission holds one until its completion callback runs
//! - a reap holds one while it waits
//!
//! The transfer handle is destroyed exactly once, when the count reaches
//! zero, which can only happen after the driver has delivered the completion
//! for every submission. References taken by submit and reap also count
//! toward the session's fly count, which is what keeps the event thread
//! polling.
//!
//! Every submission carries a generation number. The completion record is
//! tagged with it, so a reap only accepts the record of the submission it is
//! waiting for and a completion signal that arrives after its context was
//! resubmitted does not end the next reap.

use crate::driver::{
    Completion, CompletionSink, DeviceIo, EndpointKind, RawTransfer, TransferSetup,
};
use crate::error::{Result, TransferError, TransferStatus};
use crate::session::Session;
use common::Event;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, trace};

/// Status and byte count recorded by the completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompletionRecord {
    pub generation: u64,
    pub status: TransferStatus,
    pub actual_length: usize,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct ContextInner {
    pub(crate) session: Session,
    pub(crate) device: Arc<dyn DeviceIo>,
    pub(crate) kind: EndpointKind,
    pub(crate) endpoint: u8,
    /// Legacy isochronous packet size; packet count is derived per submit
    pub(crate) iso_packet_size: Option<usize>,
    refs: AtomicI32,
    /// Generation of the latest submission
    generation: AtomicU64,
    pub(crate) transfer: Mutex<Option<Box<dyn RawTransfer>>>,
    pub(crate) done: Event,
    pub(crate) record: Mutex<Option<CompletionRecord>>,
    /// Buffer handed back by the last completion or failed submit
    pub(crate) buffer: Mutex<Option<Vec<u8>>>,
}

impl ContextInner {
    pub(crate) fn ref_count(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Take the completion record of submission `generation`, if it landed
    pub(crate) fn take_record(&self, generation: u64) -> Option<CompletionRecord> {
        let mut record = lock(&self.record);
        match *record {
            Some(r) if r.generation == generation => record.take(),
            _ => None,
        }
    }

    /// Take an in-flight reference
    ///
    /// Fails, leaving the count unchanged, once the count has reached zero.
    pub(crate) fn acquire(&self) -> Result<()> {
        let previous = self.refs.fetch_add(1, Ordering::AcqRel);
        if previous <= 0 {
            self.refs.fetch_sub(1, Ordering::AcqRel);
            error!(
                "Endpoint {:#04x}: transfer context acquired with ref count {}",
                self.endpoint, previous
            );
            return Err(TransferError::PendingDeallocation);
        }
        self.session.event_thread().transfer_started();
        Ok(())
    }

    /// Drop an in-flight reference taken by [`ContextInner::acquire`]
    pub(crate) fn release(&self) {
        self.drop_ref();
        self.session.event_thread().transfer_finished();
    }

    /// Drop the owner's reference; not counted as in flight
    pub(crate) fn release_owner(&self) {
        self.drop_ref();
    }

    fn drop_ref(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.destroy();
        } else if previous <= 0 {
            error!(
                "Endpoint {:#04x}: transfer context released with ref count {}",
                self.endpoint,
                previous - 1
            );
        }
    }

    fn destroy(&self) {
        let transfer = lock(&self.transfer).take();
        if transfer.is_some() {
            trace!("Endpoint {:#04x}: freeing transfer handle", self.endpoint);
        }
        drop(transfer);
    }
}

/// Completion sink of one submission
pub(crate) struct Submission {
    inner: Arc<ContextInner>,
    generation: u64,
}

impl Submission {
    /// Start the next generation on `inner`
    pub(crate) fn begin(inner: &Arc<ContextInner>) -> Self {
        let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        Self {
            inner: Arc::clone(inner),
            generation,
        }
    }

    /// Store the outcome and drop the submission's reference
    pub(crate) fn finish(&self, completion: Completion) {
        let inner = &self.inner;
        *lock(&inner.record) = Some(CompletionRecord {
            generation: self.generation,
            status: completion.status,
            actual_length: completion.actual_length,
        });
        *lock(&inner.buffer) = Some(completion.buffer);
        inner.release();
    }
}

impl CompletionSink for Submission {
    fn complete(&self, completion: Completion) {
        // Released before signalling so a returning reap observes an idle
        // context
        self.finish(completion);
        self.inner.done.set();
    }
}

/// Releases one in-flight reference on drop
pub(crate) struct InFlightRef<'a>(pub(crate) &'a ContextInner);

impl Drop for InFlightRef<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Reusable asynchronous transfer slot for one endpoint
pub struct TransferContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl std::fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferContext")
            .field("kind", &self.inner.kind)
            .field("endpoint", &format_args!("{:#04x}", self.inner.endpoint))
            .field("refs", &self.inner.ref_count())
            .finish()
    }
}

impl TransferContext {
    /// Allocate a context for `endpoint`
    ///
    /// Starts the session's event thread if it is not running yet.
    pub fn setup(
        session: &Session,
        device: Arc<dyn DeviceIo>,
        kind: EndpointKind,
        endpoint: u8,
        iso_packet_size: Option<usize>,
    ) -> Result<Self> {
        session.start_events()?;

        let setup = TransferSetup {
            kind,
            endpoint,
            iso_packets: kind.packet_count_hint(),
        };
        let transfer = device.alloc_transfer(&setup).map_err(|e| {
            error!(
                "Endpoint {:#04x}: failed to allocate {} transfer: {}",
                endpoint, kind, e
            );
            TransferError::AllocationFailure
        })?;

        debug!("Endpoint {:#04x}: {} transfer context ready", endpoint, kind);

        Ok(Self {
            inner: Arc::new(ContextInner {
                session: session.clone(),
                device,
                kind,
                endpoint,
                iso_packet_size,
                refs: AtomicI32::new(1),
                generation: AtomicU64::new(0),
                transfer: Mutex::new(Some(transfer)),
                done: Event::auto_reset(),
                record: Mutex::new(None),
                buffer: Mutex::new(None),
            }),
        })
    }

    pub fn bulk(session: &Session, device: Arc<dyn DeviceIo>, endpoint: u8) -> Result<Self> {
        Self::setup(session, device, EndpointKind::Bulk, endpoint, None)
    }

    pub fn interrupt(session: &Session, device: Arc<dyn DeviceIo>, endpoint: u8) -> Result<Self> {
        Self::setup(session, device, EndpointKind::Interrupt, endpoint, None)
    }

    /// Isochronous context; each submission is split into `packet_size`
    /// packets
    pub fn isochronous(
        session: &Session,
        device: Arc<dyn DeviceIo>,
        endpoint: u8,
        packet_size: usize,
    ) -> Result<Self> {
        if packet_size == 0 {
            return Err(TransferError::InvalidArgument(
                "isochronous packet size must be non-zero".to_string(),
            ));
        }
        Self::setup(
            session,
            device,
            EndpointKind::Isochronous,
            endpoint,
            Some(packet_size),
        )
    }

    pub fn kind(&self) -> EndpointKind {
        self.inner.kind
    }

    pub fn endpoint(&self) -> u8 {
        self.inner.endpoint
    }

    pub fn iso_packet_size(&self) -> Option<usize> {
        self.inner.iso_packet_size
    }

    pub fn device(&self) -> &Arc<dyn DeviceIo> {
        &self.inner.device
    }

    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// Whether the context has no submission outstanding
    pub fn is_idle(&self) -> bool {
        self.inner.ref_count() == 1
    }

    /// Release the owner's reference
    ///
    /// The transfer handle is freed now if nothing is in flight, otherwise
    /// when the outstanding completion arrives.
    pub fn free(self) {
        drop(self);
    }
}

impl Drop for TransferContext {
    fn drop(&mut self) {
        if self.inner.ref_count() > 1 {
            debug!(
                "Endpoint {:#04x}: freeing transfer context with a submission in flight",
                self.inner.endpoint
            );
        }
        self.inner.release_owner();
    }
}
