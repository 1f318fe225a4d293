//! libusb backend
//!
//! Asynchronous transfers go through the raw libusb API re-exported by
//! `rusb::ffi`: rusb's safe wrappers cover only synchronous I/O, and its
//! `read_bulk` drops the byte count of a timed out transfer.

use crate::driver::{
    Completion, CompletionSink, DeviceIo, ENDPOINT_IN, EndpointKind, EventDispatch, RawOutcome,
    RawTransfer, SubmitError, SubmitRequest, TransferSetup,
};
use crate::error::{DriverError, TransferStatus};
use libc::{c_int, c_uint, c_void};
use rusb::constants::LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
use rusb::ffi::{self, libusb_transfer};
use rusb::{Context, DeviceHandle, UsbContext};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

fn timeout_ms(timeout: Duration) -> c_uint {
    c_uint::try_from(timeout.as_millis()).unwrap_or(c_uint::MAX)
}

/// Event loop of a libusb context
pub struct LibusbEvents {
    context: Context,
}

impl LibusbEvents {
    pub fn new() -> Result<Self, DriverError> {
        Ok(Self {
            context: Context::new()?,
        })
    }

    pub fn from_context(context: Context) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl EventDispatch for LibusbEvents {
    fn lock_events(&self) {
        // SAFETY: the context pointer is valid for the lifetime of `self`.
        unsafe { ffi::libusb_lock_events(self.context.as_raw()) }
    }

    fn unlock_events(&self) {
        // SAFETY: as above; only called after lock_events on this thread.
        unsafe { ffi::libusb_unlock_events(self.context.as_raw()) }
    }

    fn event_handling_ok(&self) -> bool {
        // SAFETY: the context pointer is valid for the lifetime of `self`.
        unsafe { ffi::libusb_event_handling_ok(self.context.as_raw()) != 0 }
    }

    fn handle_events_locked(&self, timeout: Duration) -> Result<(), DriverError> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        // SAFETY: the caller holds the event lock; `tv` outlives the call.
        let rc = unsafe { ffi::libusb_handle_events_locked(self.context.as_raw(), &tv) };
        if rc < 0 {
            return Err(DriverError::from_code(rc));
        }
        Ok(())
    }
}

/// An opened device
pub struct LibusbDevice {
    handle: Arc<DeviceHandle<Context>>,
}

impl LibusbDevice {
    pub fn new(handle: DeviceHandle<Context>) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    pub fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    fn sync_transfer(
        &self,
        kind: EndpointKind,
        endpoint: u8,
        data: *mut u8,
        len: usize,
        timeout: Duration,
    ) -> RawOutcome {
        let Ok(len) = c_int::try_from(len) else {
            return RawOutcome {
                result: Err(DriverError::InvalidParam),
                actual_length: 0,
            };
        };
        let mut transferred: c_int = 0;
        // SAFETY: `data` points to `len` bytes borrowed by the caller for the
        // duration of this blocking call.
        let rc = unsafe {
            match kind {
                EndpointKind::Interrupt => ffi::libusb_interrupt_transfer(
                    self.handle.as_raw(),
                    endpoint,
                    data,
                    len,
                    &mut transferred,
                    timeout_ms(timeout),
                ),
                _ => ffi::libusb_bulk_transfer(
                    self.handle.as_raw(),
                    endpoint,
                    data,
                    len,
                    &mut transferred,
                    timeout_ms(timeout),
                ),
            }
        };
        RawOutcome {
            result: if rc < 0 {
                Err(DriverError::from_code(rc))
            } else {
                Ok(())
            },
            actual_length: transferred.max(0) as usize,
        }
    }
}

impl DeviceIo for LibusbDevice {
    fn alloc_transfer(&self, setup: &TransferSetup) -> Result<Box<dyn RawTransfer>, DriverError> {
        let packets = c_int::try_from(setup.iso_packets).map_err(|_| DriverError::InvalidParam)?;
        // SAFETY: plain allocation; null is checked below.
        let transfer = unsafe { ffi::libusb_alloc_transfer(packets) };
        let Some(transfer) = NonNull::new(transfer) else {
            return Err(DriverError::NoMem);
        };
        Ok(Box::new(LibusbTransfer {
            transfer,
            handle: Arc::clone(&self.handle),
            kind: setup.kind,
            endpoint: setup.endpoint,
            iso_capacity: setup.iso_packets,
        }))
    }

    fn read_bulk(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> RawOutcome {
        self.sync_transfer(
            EndpointKind::Bulk,
            endpoint,
            data.as_mut_ptr(),
            data.len(),
            timeout,
        )
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> RawOutcome {
        // libusb does not write through the buffer of an OUT transfer
        self.sync_transfer(
            EndpointKind::Bulk,
            endpoint,
            data.as_ptr() as *mut u8,
            data.len(),
            timeout,
        )
    }

    fn read_interrupt(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> RawOutcome {
        self.sync_transfer(
            EndpointKind::Interrupt,
            endpoint,
            data.as_mut_ptr(),
            data.len(),
            timeout,
        )
    }

    fn write_interrupt(&self, endpoint: u8, data: &[u8], timeout: Duration) -> RawOutcome {
        self.sync_transfer(
            EndpointKind::Interrupt,
            endpoint,
            data.as_ptr() as *mut u8,
            data.len(),
            timeout,
        )
    }

    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, DriverError> {
        let result = if request_type & ENDPOINT_IN != 0 {
            self.handle
                .read_control(request_type, request, value, index, data, timeout)
        } else {
            self.handle
                .write_control(request_type, request, value, index, data, timeout)
        };
        result.map_err(DriverError::from)
    }
}

/// State carried through `user_data` while a submission is in flight
struct InFlight {
    sink: Arc<dyn CompletionSink>,
    buffer: Vec<u8>,
    iso_packets: usize,
}

struct LibusbTransfer {
    transfer: NonNull<libusb_transfer>,
    handle: Arc<DeviceHandle<Context>>,
    kind: EndpointKind,
    endpoint: u8,
    iso_capacity: usize,
}

// SAFETY: the transfer struct is only touched by its owning context (behind
// a mutex) and by libusb's callback on the event thread while in flight.
unsafe impl Send for LibusbTransfer {}

impl RawTransfer for LibusbTransfer {
    fn submit(
        &mut self,
        request: SubmitRequest,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<(), SubmitError> {
        let SubmitRequest {
            mut buffer,
            length,
            timeout,
            iso,
        } = request;

        let Ok(c_length) = c_int::try_from(length) else {
            return Err(SubmitError {
                error: DriverError::InvalidParam,
                buffer,
            });
        };
        let iso_packets = iso.map_or(0, |layout| layout.packets);
        if iso_packets > self.iso_capacity {
            return Err(SubmitError {
                error: DriverError::InvalidParam,
                buffer,
            });
        }

        let data = buffer.as_mut_ptr();
        let user_data = Box::into_raw(Box::new(InFlight {
            sink,
            buffer,
            iso_packets,
        })) as *mut c_void;
        let transfer = self.transfer.as_ptr();
        let dev_handle = self.handle.as_raw();
        let timeout = timeout_ms(timeout);

        // SAFETY: `transfer` was allocated with `iso_capacity` packet
        // descriptors and is not in flight (the owning context guarantees a
        // single outstanding submission). `data` stays valid because the
        // Vec is owned by `user_data` until the callback reclaims it.
        let rc = unsafe {
            match self.kind {
                EndpointKind::Bulk => ffi::libusb_fill_bulk_transfer(
                    transfer,
                    dev_handle,
                    self.endpoint,
                    data,
                    c_length,
                    transfer_finished as _,
                    user_data,
                    timeout,
                ),
                EndpointKind::Interrupt => ffi::libusb_fill_interrupt_transfer(
                    transfer,
                    dev_handle,
                    self.endpoint,
                    data,
                    c_length,
                    transfer_finished as _,
                    user_data,
                    timeout,
                ),
                EndpointKind::Isochronous => {
                    let t = &mut *transfer;
                    t.dev_handle = dev_handle;
                    t.endpoint = self.endpoint;
                    t.transfer_type = LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
                    t.timeout = timeout;
                    t.buffer = data;
                    t.length = c_length;
                    t.num_iso_packets = iso_packets as c_int;
                    t.callback = transfer_finished as _;
                    t.user_data = user_data;
                    let packet_size = iso.map_or(0, |layout| layout.packet_size) as c_uint;
                    let descriptors = t.iso_packet_desc.as_mut_ptr();
                    for i in 0..iso_packets {
                        (*descriptors.add(i)).length = packet_size;
                    }
                }
            }
            ffi::libusb_submit_transfer(transfer)
        };

        if rc < 0 {
            // SAFETY: libusb rejected the transfer, so the callback will not
            // run and `user_data` is still exclusively ours.
            let in_flight = unsafe {
                (*transfer).user_data = ptr::null_mut();
                Box::from_raw(user_data as *mut InFlight)
            };
            return Err(SubmitError {
                error: DriverError::from_code(rc),
                buffer: in_flight.buffer,
            });
        }
        Ok(())
    }

    fn cancel(&self) -> Result<(), DriverError> {
        // SAFETY: the transfer is allocated; cancelling an idle transfer
        // returns NOT_FOUND.
        let rc = unsafe { ffi::libusb_cancel_transfer(self.transfer.as_ptr()) };
        if rc < 0 {
            return Err(DriverError::from_code(rc));
        }
        Ok(())
    }
}

impl Drop for LibusbTransfer {
    fn drop(&mut self) {
        // SAFETY: the owning context drops us only after the last completion
        // callback has returned its reference.
        unsafe { ffi::libusb_free_transfer(self.transfer.as_ptr()) };
    }
}

extern "system" fn transfer_finished(transfer_ptr: *mut libusb_transfer) {
    if transfer_ptr.is_null() {
        return;
    }

    // SAFETY: libusb passes the transfer it completed; it stays allocated at
    // least until the sink releases its reference below.
    let transfer = unsafe { &mut *transfer_ptr };
    let user_data = std::mem::replace(&mut transfer.user_data, ptr::null_mut());
    if user_data.is_null() {
        return;
    }

    // SAFETY: user_data was produced by Box::into_raw in submit.
    let in_flight = unsafe { Box::from_raw(user_data as *mut InFlight) };
    let status = TransferStatus::from_raw(transfer.status);

    let actual_length = if in_flight.iso_packets > 0 {
        let descriptors = transfer.iso_packet_desc.as_ptr();
        (0..in_flight.iso_packets)
            // SAFETY: the transfer was submitted with this many descriptors.
            .map(|i| unsafe { (*descriptors.add(i)).actual_length } as usize)
            .sum()
    } else {
        transfer.actual_length.max(0) as usize
    };

    trace!(
        "Endpoint {:#04x}: transfer finished with {:?} ({} bytes)",
        transfer.endpoint, status, actual_length
    );

    let InFlight { sink, buffer, .. } = *in_flight;
    // May free the transfer; it must not be touched after this call.
    sink.complete(Completion {
        status,
        actual_length,
        buffer,
    });
}
