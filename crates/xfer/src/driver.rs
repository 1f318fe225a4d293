//! Seams to the native USB stack
//!
//! The engine never calls libusb directly. It talks to three traits:
//!
//! - [`EventDispatch`] is the session-wide event loop (lock, poll, unlock)
//! - [`DeviceIo`] is one opened device: transfer allocation plus the
//!   synchronous primitives
//! - [`RawTransfer`] is one low-level asynchronous transfer handle, reused
//!   across submissions and freed on drop
//!
//! [`crate::libusb`] implements them over `rusb`; [`crate::test_utils`]
//! provides scripted implementations for tests.

use crate::error::{DriverError, TransferStatus};
use std::sync::Arc;
use std::time::Duration;

/// Largest number of isochronous packets a single transfer may carry
pub const MAX_ISO_PACKETS: usize = 1024;

/// Direction bit of an endpoint address
pub const ENDPOINT_IN: u8 = 0x80;

pub fn is_in_endpoint(endpoint: u8) -> bool {
    endpoint & ENDPOINT_IN != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Bulk,
    Interrupt,
    Isochronous,
}

impl EndpointKind {
    /// Number of isochronous packet descriptors to reserve at allocation
    pub fn packet_count_hint(self) -> usize {
        match self {
            EndpointKind::Isochronous => MAX_ISO_PACKETS,
            EndpointKind::Bulk | EndpointKind::Interrupt => 0,
        }
    }

    /// `None` for control endpoints, which have no async context here
    pub fn from_transfer_type(transfer_type: rusb::TransferType) -> Option<Self> {
        match transfer_type {
            rusb::TransferType::Bulk => Some(EndpointKind::Bulk),
            rusb::TransferType::Interrupt => Some(EndpointKind::Interrupt),
            rusb::TransferType::Isochronous => Some(EndpointKind::Isochronous),
            rusb::TransferType::Control => None,
        }
    }
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Bulk => f.write_str("Bulk"),
            EndpointKind::Interrupt => f.write_str("Interrupt"),
            EndpointKind::Isochronous => f.write_str("Isochronous"),
        }
    }
}

/// Parameters for allocating a transfer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSetup {
    pub kind: EndpointKind,
    pub endpoint: u8,
    pub iso_packets: usize,
}

/// Isochronous packet layout for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoLayout {
    pub packets: usize,
    pub packet_size: usize,
}

/// One submission of a transfer handle
///
/// The buffer is owned by the driver until the completion hands it back.
#[derive(Debug)]
pub struct SubmitRequest {
    pub buffer: Vec<u8>,
    pub length: usize,
    pub timeout: Duration,
    pub iso: Option<IsoLayout>,
}

/// A submission the driver refused; the buffer is returned to the caller
#[derive(Debug)]
pub struct SubmitError {
    pub error: DriverError,
    pub buffer: Vec<u8>,
}

#[derive(Debug)]
pub struct Completion {
    pub status: TransferStatus,
    pub actual_length: usize,
    pub buffer: Vec<u8>,
}

/// Receiver of transfer completions
///
/// Called from the event thread, from inside the driver's poll. Implementors
/// must not block.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, completion: Completion);
}

pub trait RawTransfer: Send {
    fn submit(
        &mut self,
        request: SubmitRequest,
        sink: Arc<dyn CompletionSink>,
    ) -> std::result::Result<(), SubmitError>;

    /// Ask the driver to cancel an in-flight submission
    ///
    /// The completion (with a cancelled status) still arrives through the
    /// sink.
    fn cancel(&self) -> std::result::Result<(), DriverError>;
}

/// Outcome of a synchronous transfer
///
/// `actual_length` is valid even when `result` is an error, which is what
/// lets a timed out read report a short transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawOutcome {
    pub result: std::result::Result<(), DriverError>,
    pub actual_length: usize,
}

/// An opened device
pub trait DeviceIo: Send + Sync {
    fn alloc_transfer(
        &self,
        setup: &TransferSetup,
    ) -> std::result::Result<Box<dyn RawTransfer>, DriverError>;

    fn read_bulk(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> RawOutcome;

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> RawOutcome;

    fn read_interrupt(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> RawOutcome;

    fn write_interrupt(&self, endpoint: u8, data: &[u8], timeout: Duration) -> RawOutcome;

    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, DriverError>;
}

/// The driver's event loop
///
/// Only the event thread calls these.
pub trait EventDispatch: Send + Sync {
    fn lock_events(&self);

    fn unlock_events(&self);

    /// Whether this thread may still handle events while holding the lock
    fn event_handling_ok(&self) -> bool;

    /// Poll for and dispatch completions, blocking at most `timeout`
    fn handle_events_locked(&self, timeout: Duration) -> std::result::Result<(), DriverError>;
}
