//! Bounded window of in-flight transfers on one endpoint
//!
//! Up to `buffer_count` transfers are kept queued. Each [`PipelineWindow::pump`]
//! tops the window up and then reaps the oldest submission, so completions
//! come back in submission order and the device always has work queued.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use xfer::{DeviceIo, EndpointKind, Result, Session, TransferContext, TransferError};

/// An endpoint the benchmark moves data on
#[derive(Clone)]
pub struct EndpointTarget {
    pub session: Session,
    pub device: Arc<dyn DeviceIo>,
    pub kind: EndpointKind,
    pub endpoint: u8,
    /// Isochronous packet size; ignored for other endpoint kinds
    pub iso_packet_size: usize,
}

impl EndpointTarget {
    pub fn is_in(&self) -> bool {
        xfer::driver::is_in_endpoint(self.endpoint)
    }

    fn setup_context(&self) -> Result<TransferContext> {
        match self.kind {
            EndpointKind::Bulk => {
                TransferContext::bulk(&self.session, self.device.clone(), self.endpoint)
            }
            EndpointKind::Interrupt => {
                TransferContext::interrupt(&self.session, self.device.clone(), self.endpoint)
            }
            EndpointKind::Isochronous => TransferContext::isochronous(
                &self.session,
                self.device.clone(),
                self.endpoint,
                self.iso_packet_size,
            ),
        }
    }
}

impl std::fmt::Debug for EndpointTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointTarget")
            .field("kind", &self.kind)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("iso_packet_size", &self.iso_packet_size)
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    context: Option<TransferContext>,
    /// Present while the slot is idle; owned by the driver while in use
    buffer: Option<Vec<u8>>,
    in_use: bool,
}

/// A reaped transfer: which slot, and how many bytes moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub slot: usize,
    pub length: usize,
}

pub struct PipelineWindow {
    target: EndpointTarget,
    slots: Vec<Slot>,
    buffer_size: usize,
    timeout: Duration,
    next_index: usize,
    wait_index: usize,
    outstanding: usize,
}

impl PipelineWindow {
    /// Window of `buffer_count` zeroed buffers of `buffer_size` bytes
    pub fn new(
        target: EndpointTarget,
        buffer_count: usize,
        buffer_size: usize,
        timeout: Duration,
    ) -> Self {
        let buffers = (0..buffer_count).map(|_| vec![0u8; buffer_size]).collect();
        Self::with_buffers(target, buffers, buffer_size, timeout)
    }

    /// Window over caller-filled buffers, one slot per buffer
    pub fn with_buffers(
        target: EndpointTarget,
        buffers: Vec<Vec<u8>>,
        buffer_size: usize,
        timeout: Duration,
    ) -> Self {
        let slots = buffers
            .into_iter()
            .map(|buffer| Slot {
                context: None,
                buffer: Some(buffer),
                in_use: false,
            })
            .collect();
        Self {
            target,
            slots,
            buffer_size,
            timeout,
            next_index: 0,
            wait_index: 0,
            outstanding: 0,
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.slots.len()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn wait_index(&self) -> usize {
        self.wait_index
    }

    pub fn is_in_use(&self, slot: usize) -> bool {
        self.slots.get(slot).is_some_and(|s| s.in_use)
    }

    /// Contexts set up so far
    pub fn contexts(&self) -> usize {
        self.slots.iter().filter(|s| s.context.is_some()).count()
    }

    /// Data of a reaped transfer
    pub fn data(&self, reaped: Reaped) -> &[u8] {
        match self.slots.get(reaped.slot).and_then(|s| s.buffer.as_deref()) {
            Some(buffer) => &buffer[..reaped.length.min(buffer.len())],
            None => &[],
        }
    }

    /// Fill the window, then reap the oldest transfer
    ///
    /// A failed submit leaves the indices and the outstanding count as they
    /// were. A reap that gives up while the transfer is still queued leaves
    /// the slot in use, to be waited on again or cancelled by
    /// [`PipelineWindow::drain`]; a transfer that completed with an error
    /// frees its slot.
    pub fn pump(&mut self) -> Result<Reaped> {
        let count = self.slots.len();
        if count == 0 {
            return Err(TransferError::InvalidArgument(
                "pipeline window has no slots".to_string(),
            ));
        }

        while self.outstanding < count {
            let index = self.next_index;
            let slot = &mut self.slots[index];

            if slot.context.is_none() {
                slot.context = Some(self.target.setup_context().inspect_err(|e| {
                    error!(
                        "Endpoint {:#04x}: failed creating transfer context: {}",
                        self.target.endpoint, e
                    );
                })?);
            }
            let Some(context) = slot.context.as_ref() else {
                return Err(TransferError::PendingDeallocation);
            };

            let buffer = slot
                .buffer
                .take()
                .unwrap_or_else(|| vec![0u8; self.buffer_size]);
            if let Err(e) = context.submit(buffer, self.buffer_size, self.timeout) {
                slot.buffer = context.take_buffer();
                return Err(e);
            }

            slot.in_use = true;
            self.outstanding += 1;
            self.next_index = (self.next_index + 1) % count;
        }

        let index = self.wait_index;
        let slot = &mut self.slots[index];
        let Some(context) = slot.context.as_ref() else {
            return Err(TransferError::PendingDeallocation);
        };

        let result = match context.reap(Some(self.timeout), false) {
            // Still queued on the device; the next pump waits on it again
            Err(e) if !context.is_idle() => return Err(e),
            // Completed after the reap gave up; its status is stored
            Err(e) if e.is_timeout() => context.reap(Some(Duration::ZERO), false),
            result => result,
        };

        slot.buffer = context.take_buffer();
        slot.in_use = false;
        self.outstanding -= 1;
        self.wait_index = (self.wait_index + 1) % count;

        result.map(|length| Reaped {
            slot: index,
            length,
        })
    }

    /// Cancel and wait out every in-use slot, then free all contexts
    pub fn drain(&mut self, quiet: bool) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(context) = slot.context.take() else {
                continue;
            };

            if slot.in_use && !context.is_idle() {
                if let Err(e) = context.cancel()
                    && !quiet
                {
                    warn!(
                        "Endpoint {:#04x}: cancel transfer failed: {}",
                        self.target.endpoint, e
                    );
                }
                // A transfer that finished before the cancel still delivers
                // its completion
                if let Err(e) = context.reap(None, false) {
                    debug!(
                        "Endpoint {:#04x}: slot {} drained with {}",
                        self.target.endpoint, index, e
                    );
                }
            }
            if let Some(buffer) = context.take_buffer() {
                slot.buffer = Some(buffer);
            }
            slot.in_use = false;

            context.free();
        }
        self.outstanding = 0;
    }
}

impl Drop for PipelineWindow {
    fn drop(&mut self) {
        if self.contexts() > 0 {
            self.drain(true);
        }
    }
}
