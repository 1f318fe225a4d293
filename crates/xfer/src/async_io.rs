//! Submit/reap protocol on transfer contexts

use crate::context::{InFlightRef, Submission, TransferContext, lock};
use crate::driver::{
    CompletionSink, EndpointKind, IsoLayout, MAX_ISO_PACKETS, SubmitError, SubmitRequest,
};
use crate::error::{Result, TransferError, translate_status};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

impl TransferContext {
    /// Queue `buffer[..length]` on the endpoint without waiting
    ///
    /// The context must be idle (no submission outstanding). The buffer is
    /// owned by the driver until the transfer completes; get it back with
    /// [`TransferContext::take_buffer`] after [`TransferContext::reap`].
    pub fn submit(&self, buffer: Vec<u8>, length: usize, timeout: Duration) -> Result<()> {
        let inner = &self.inner;

        if length > buffer.len() {
            return Err(TransferError::InvalidArgument(format!(
                "length {} exceeds buffer of {} bytes",
                length,
                buffer.len()
            )));
        }

        let refs = inner.ref_count();
        if refs != 1 {
            return Err(TransferError::InvalidArgument(format!(
                "transfer context is busy (ref count {})",
                refs
            )));
        }

        let iso = match (inner.kind, inner.iso_packet_size) {
            (EndpointKind::Isochronous, Some(packet_size)) => {
                // A trailing partial packet is dropped
                let packets = length / packet_size;
                if packets == 0 || packets > MAX_ISO_PACKETS {
                    return Err(TransferError::InvalidArgument(format!(
                        "{} bytes make {} packets of {} (allowed 1..={})",
                        length, packets, packet_size, MAX_ISO_PACKETS
                    )));
                }
                Some(IsoLayout {
                    packets,
                    packet_size,
                })
            }
            _ => None,
        };

        *lock(&inner.record) = None;
        inner.done.reset();
        inner.acquire()?;

        let sink = Arc::new(Submission::begin(inner)) as Arc<dyn CompletionSink>;
        let request = SubmitRequest {
            buffer,
            length,
            timeout,
            iso,
        };

        let submitted = lock(&inner.transfer)
            .as_mut()
            .map(|transfer| transfer.submit(request, sink));
        let Some(submitted) = submitted else {
            inner.release();
            return Err(TransferError::PendingDeallocation);
        };

        match submitted {
            Ok(()) => {
                trace!(
                    "Endpoint {:#04x}: submitted {} bytes",
                    inner.endpoint, length
                );
                Ok(())
            }
            Err(SubmitError { error, buffer }) => {
                *lock(&inner.buffer) = Some(buffer);
                inner.release();
                debug!(
                    "Endpoint {:#04x}: submit failed: {}",
                    inner.endpoint, error
                );
                Err(error.into())
            }
        }
    }

    /// Wait for the outstanding submission and return the bytes moved
    ///
    /// `None` waits forever. If the wait times out and `cancel_on_timeout` is
    /// set, the transfer is cancelled once and the cancellation's completion
    /// is awaited without a limit; it is never escalated again.
    ///
    /// Only the completion of the latest submission ends the wait. A
    /// completion stored just as the wait gives up is still returned.
    pub fn reap(&self, timeout: Option<Duration>, cancel_on_timeout: bool) -> Result<usize> {
        let inner = &self.inner;

        let refs = inner.ref_count();
        if refs < 1 {
            return Err(TransferError::InvalidArgument(format!(
                "transfer context already freed (ref count {})",
                refs
            )));
        }

        inner.acquire()?;
        let _held = InFlightRef(inner);

        let generation = inner.generation();
        let mut deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut cancelled = false;
        let record = loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let signalled = inner.done.wait(remaining);
            if let Some(record) = inner.take_record(generation) {
                break record;
            }
            if signalled {
                trace!(
                    "Endpoint {:#04x}: ignoring completion signal of an earlier submission",
                    inner.endpoint
                );
                continue;
            }
            if !cancel_on_timeout || cancelled {
                return Err(TransferError::Timeout);
            }

            debug!(
                "Endpoint {:#04x}: reap timed out, cancelling",
                inner.endpoint
            );
            if let Err(e) = self.cancel_in_flight() {
                warn!("Endpoint {:#04x}: cancel failed: {}", inner.endpoint, e);
            }
            cancelled = true;
            deadline = None;
        };

        let result = translate_status(
            record.status,
            record.actual_length,
            inner.session.short_read_on_timeout(),
        );
        trace!(
            "Endpoint {:#04x}: reaped {:?} ({} bytes)",
            inner.endpoint, record.status, record.actual_length
        );
        result
    }

    /// Request cancellation of the outstanding submission
    ///
    /// A no-op when nothing is outstanding. The cancelled transfer still
    /// has to be reaped.
    pub fn cancel(&self) -> Result<()> {
        if self.inner.ref_count() <= 1 {
            return Ok(());
        }
        self.cancel_in_flight()
    }

    fn cancel_in_flight(&self) -> Result<()> {
        let transfer = lock(&self.inner.transfer);
        match transfer.as_ref() {
            Some(transfer) => transfer.cancel().map_err(TransferError::from),
            None => Err(TransferError::PendingDeallocation),
        }
    }

    /// Take back the buffer from the last completion or failed submit
    pub fn take_buffer(&self) -> Option<Vec<u8>> {
        lock(&self.inner.buffer).take()
    }
}

#[cfg(test)]
mod tests {
    use crate::context::{Submission, TransferContext};
    use crate::driver::Completion;
    use crate::error::{FailureKind, TransferError, TransferStatus};
    use crate::session::{Session, SessionOptions};
    use crate::test_utils::{EndpointBehavior, MockDevice, MockEvents};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn setup(short_read_on_timeout: bool) -> (Session, Arc<MockDevice>) {
        let events = Arc::new(MockEvents::new());
        let device = Arc::new(MockDevice::new(&events));
        let options = SessionOptions {
            poll_interval: Duration::from_millis(10),
            short_read_on_timeout,
        };
        (Session::new(events, options), device)
    }

    #[test]
    fn test_submit_reap_cycle_reuses_handle() {
        let (session, device) = setup(true);
        let ctx = TransferContext::bulk(&session, device.clone(), 0x81).unwrap();

        for _ in 0..3 {
            ctx.submit(vec![0u8; 512], 512, TIMEOUT).unwrap();
            assert_eq!(ctx.reap(Some(TIMEOUT), false).unwrap(), 512);
            assert!(ctx.is_idle());
            assert_eq!(ctx.take_buffer().unwrap().len(), 512);
        }

        assert_eq!(device.allocations(), 1);
        assert_eq!(device.submissions(0x81), 3);
        assert_eq!(session.event_thread().fly_count(), 0);
    }

    #[test]
    fn test_submit_rejects_short_buffer() {
        let (session, device) = setup(true);
        let ctx = TransferContext::bulk(&session, device, 0x81).unwrap();
        assert!(matches!(
            ctx.submit(vec![0u8; 10], 11, TIMEOUT),
            Err(TransferError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_submit_rejects_busy_context() {
        let (session, device) = setup(true);
        device.set_behavior(0x81, EndpointBehavior::NeverComplete);
        let ctx = TransferContext::bulk(&session, device, 0x81).unwrap();

        ctx.submit(vec![0u8; 64], 64, TIMEOUT).unwrap();
        assert_eq!(ctx.ref_count(), 2);
        assert!(matches!(
            ctx.submit(vec![0u8; 64], 64, TIMEOUT),
            Err(TransferError::InvalidArgument(_))
        ));

        ctx.cancel().unwrap();
        assert!(ctx.reap(None, false).is_err());
        assert!(ctx.is_idle());
    }

    #[test]
    fn test_submit_failure_releases_and_returns_buffer() {
        let (session, device) = setup(true);
        device.set_behavior(
            0x02,
            EndpointBehavior::RejectSubmit(crate::error::DriverError::NoDevice),
        );
        let ctx = TransferContext::bulk(&session, device, 0x02).unwrap();

        assert!(matches!(
            ctx.submit(vec![7u8; 32], 32, TIMEOUT),
            Err(TransferError::NoDevice)
        ));
        assert!(ctx.is_idle());
        assert_eq!(session.event_thread().fly_count(), 0);
        assert_eq!(ctx.take_buffer().unwrap(), vec![7u8; 32]);
    }

    #[test]
    fn test_reap_without_cancel_times_out() {
        let (session, device) = setup(true);
        device.set_behavior(0x81, EndpointBehavior::NeverComplete);
        let ctx = TransferContext::bulk(&session, device.clone(), 0x81).unwrap();

        ctx.submit(vec![0u8; 64], 64, TIMEOUT).unwrap();
        assert!(
            ctx.reap(Some(Duration::from_millis(20)), false)
                .unwrap_err()
                .is_timeout()
        );
        assert_eq!(device.cancels(), 0);
        // Still in flight
        assert_eq!(ctx.ref_count(), 2);

        ctx.cancel().unwrap();
        assert!(ctx.reap(None, false).unwrap_err().is_timeout());
        assert_eq!(ctx.ref_count(), 1);
    }

    #[test]
    fn test_cancel_on_timeout_escalates_once() {
        let (session, device) = setup(true);
        device.set_behavior(0x81, EndpointBehavior::NeverComplete);
        let ctx = TransferContext::bulk(&session, device.clone(), 0x81).unwrap();

        ctx.submit(vec![0u8; 64], 64, TIMEOUT).unwrap();
        let start = Instant::now();
        let result = ctx.reap(Some(Duration::from_millis(100)), true);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(device.cancels(), 1);
        assert!(ctx.is_idle());
        assert_eq!(session.event_thread().fly_count(), 0);
    }

    #[test]
    fn test_late_signal_does_not_end_next_reap() {
        let (session, device) = setup(true);
        let ctx = TransferContext::bulk(&session, device.clone(), 0x81).unwrap();

        // Completion stored and released, its signal still on the way
        ctx.inner.acquire().unwrap();
        let first = Submission::begin(&ctx.inner);
        first.finish(Completion {
            status: TransferStatus::Completed,
            actual_length: 64,
            buffer: vec![1u8; 64],
        });
        assert!(ctx.is_idle());
        assert_eq!(ctx.reap(Some(Duration::ZERO), false).unwrap(), 64);
        assert_eq!(ctx.take_buffer().unwrap(), vec![1u8; 64]);

        device.set_behavior(0x81, EndpointBehavior::NeverComplete);
        ctx.submit(vec![0u8; 64], 64, TIMEOUT).unwrap();
        ctx.inner.done.set();

        assert!(
            ctx.reap(Some(Duration::from_millis(50)), false)
                .unwrap_err()
                .is_timeout()
        );
        assert_eq!(ctx.ref_count(), 2);

        ctx.cancel().unwrap();
        assert!(ctx.reap(None, false).unwrap_err().is_timeout());
        assert!(ctx.is_idle());
        assert_eq!(session.event_thread().fly_count(), 0);
    }

    #[test]
    fn test_cancelled_partial_read_is_short_success() {
        let (session, device) = setup(true);
        device.set_behavior(0x81, EndpointBehavior::CancelledAfter(100));
        let ctx = TransferContext::bulk(&session, device.clone(), 0x81).unwrap();

        ctx.submit(vec![0u8; 512], 512, TIMEOUT).unwrap();
        assert_eq!(ctx.reap(Some(Duration::from_millis(20)), true).unwrap(), 100);
    }

    #[test]
    fn test_cancelled_partial_read_without_compat_is_timeout() {
        let (session, device) = setup(false);
        device.set_behavior(0x81, EndpointBehavior::CancelledAfter(100));
        let ctx = TransferContext::bulk(&session, device.clone(), 0x81).unwrap();

        ctx.submit(vec![0u8; 512], 512, TIMEOUT).unwrap();
        assert!(
            ctx.reap(Some(Duration::from_millis(20)), true)
                .unwrap_err()
                .is_timeout()
        );
    }

    #[test]
    fn test_failed_status_is_reported() {
        let (session, device) = setup(true);
        device.set_behavior(0x81, EndpointBehavior::Fail(TransferStatus::Stall));
        let ctx = TransferContext::bulk(&session, device, 0x81).unwrap();

        ctx.submit(vec![0u8; 64], 64, TIMEOUT).unwrap();
        assert!(matches!(
            ctx.reap(Some(TIMEOUT), false),
            Err(TransferError::TransferFailed(FailureKind::Stall))
        ));
        assert!(ctx.is_idle());
    }

    #[test]
    fn test_cancel_idle_context_is_noop() {
        let (session, device) = setup(true);
        let ctx = TransferContext::bulk(&session, device.clone(), 0x81).unwrap();
        ctx.cancel().unwrap();
        assert_eq!(device.cancels(), 0);
    }

    #[test]
    fn test_iso_packet_layout() {
        let (session, device) = setup(true);
        let ctx = TransferContext::isochronous(&session, device.clone(), 0x83, 512).unwrap();

        ctx.submit(vec![0u8; 2048], 2048, TIMEOUT).unwrap();
        ctx.reap(Some(TIMEOUT), false).unwrap();
        let layout = device.last_request(0x83).unwrap().iso.unwrap();
        assert_eq!((layout.packets, layout.packet_size), (4, 512));

        // Trailing partial packet is truncated
        let buffer = ctx.take_buffer().unwrap();
        ctx.submit(buffer, 2047, TIMEOUT).unwrap();
        ctx.reap(Some(TIMEOUT), false).unwrap();
        let layout = device.last_request(0x83).unwrap().iso.unwrap();
        assert_eq!((layout.packets, layout.packet_size), (3, 512));

        assert!(matches!(
            ctx.submit(vec![0u8; 511], 511, TIMEOUT),
            Err(TransferError::InvalidArgument(_))
        ));
        assert!(ctx.is_idle());
    }

    #[test]
    fn test_iso_packet_limit() {
        let (session, device) = setup(true);
        let ctx = TransferContext::isochronous(&session, device, 0x83, 1).unwrap();
        assert!(matches!(
            ctx.submit(vec![0u8; 1025], 1025, TIMEOUT),
            Err(TransferError::InvalidArgument(_))
        ));
        ctx.submit(vec![0u8; 1024], 1024, TIMEOUT).unwrap();
        ctx.reap(Some(TIMEOUT), false).unwrap();
    }

    #[test]
    fn test_free_with_transfer_in_flight() {
        let (session, device) = setup(true);
        device.set_behavior(0x81, EndpointBehavior::NeverComplete);
        let ctx = TransferContext::bulk(&session, device.clone(), 0x81).unwrap();

        ctx.submit(vec![0u8; 64], 64, TIMEOUT).unwrap();
        ctx.cancel().unwrap();
        ctx.free();

        // Freed by the completion callback on the event thread
        let deadline = Instant::now() + Duration::from_secs(2);
        while device.frees() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(device.frees(), 1);
    }
}
