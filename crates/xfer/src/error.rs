//! Transfer error types
//!
//! Driver result codes and completion statuses are translated into
//! [`TransferError`] exactly once, at the submit/reap (or synchronous call)
//! boundary. Everything above that boundary sees only this taxonomy.

use rusb::constants::*;
use thiserror::Error;

/// Result code reported by the native USB stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied")]
    Access,
    #[error("no such device")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    #[error("overflow")]
    Overflow,
    #[error("pipe error")]
    Pipe,
    #[error("system call interrupted")]
    Interrupted,
    #[error("insufficient memory")]
    NoMem,
    #[error("operation not supported")]
    NotSupported,
    #[error("other error")]
    Other,
}

impl DriverError {
    /// Map a negative libusb return code
    pub fn from_code(code: i32) -> Self {
        match code {
            LIBUSB_ERROR_IO => DriverError::Io,
            LIBUSB_ERROR_INVALID_PARAM => DriverError::InvalidParam,
            LIBUSB_ERROR_ACCESS => DriverError::Access,
            LIBUSB_ERROR_NO_DEVICE => DriverError::NoDevice,
            LIBUSB_ERROR_NOT_FOUND => DriverError::NotFound,
            LIBUSB_ERROR_BUSY => DriverError::Busy,
            LIBUSB_ERROR_TIMEOUT => DriverError::Timeout,
            LIBUSB_ERROR_OVERFLOW => DriverError::Overflow,
            LIBUSB_ERROR_PIPE => DriverError::Pipe,
            LIBUSB_ERROR_INTERRUPTED => DriverError::Interrupted,
            LIBUSB_ERROR_NO_MEM => DriverError::NoMem,
            LIBUSB_ERROR_NOT_SUPPORTED => DriverError::NotSupported,
            _ => DriverError::Other,
        }
    }
}

impl From<rusb::Error> for DriverError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Io => DriverError::Io,
            rusb::Error::InvalidParam => DriverError::InvalidParam,
            rusb::Error::Access => DriverError::Access,
            rusb::Error::NoDevice => DriverError::NoDevice,
            rusb::Error::NotFound => DriverError::NotFound,
            rusb::Error::Busy => DriverError::Busy,
            rusb::Error::Timeout => DriverError::Timeout,
            rusb::Error::Overflow => DriverError::Overflow,
            rusb::Error::Pipe => DriverError::Pipe,
            rusb::Error::Interrupted => DriverError::Interrupted,
            rusb::Error::NoMem => DriverError::NoMem,
            rusb::Error::NotSupported => DriverError::NotSupported,
            _ => DriverError::Other,
        }
    }
}

/// Final status of an asynchronous transfer, as reported by the completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub fn from_raw(status: i32) -> Self {
        match status {
            LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
            LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
            LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
            LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
            LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
            LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }
}

/// Why a transfer failed, when it is not a timeout or a vanished device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Stall,
    Overflow,
    Io,
    Busy,
    Access,
    NotSupported,
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Stall => "endpoint stalled",
            FailureKind::Overflow => "device sent more data than requested",
            FailureKind::Io => "I/O error",
            FailureKind::Busy => "resource busy",
            FailureKind::Access => "access denied",
            FailureKind::NotSupported => "not supported",
            FailureKind::Other => "unspecified failure",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the transfer engine
#[derive(Debug, Error)]
pub enum TransferError {
    /// The driver could not allocate a transfer handle
    #[error("Failed to allocate transfer")]
    AllocationFailure,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The context's reference count already reached zero
    #[error("Transfer context is pending deallocation")]
    PendingDeallocation,

    #[error("Transfer timed out")]
    Timeout,

    #[error("Transfer failed: {0}")]
    TransferFailed(FailureKind),

    #[error("Device disconnected")]
    NoDevice,

    #[error("Failed to spawn event thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

impl TransferError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout)
    }
}

impl From<DriverError> for TransferError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Timeout => TransferError::Timeout,
            DriverError::NoDevice => TransferError::NoDevice,
            DriverError::NoMem => TransferError::AllocationFailure,
            DriverError::InvalidParam => {
                TransferError::InvalidArgument("rejected by driver".to_string())
            }
            DriverError::Pipe => TransferError::TransferFailed(FailureKind::Stall),
            DriverError::Overflow => TransferError::TransferFailed(FailureKind::Overflow),
            DriverError::Io => TransferError::TransferFailed(FailureKind::Io),
            DriverError::Busy => TransferError::TransferFailed(FailureKind::Busy),
            DriverError::Access => TransferError::TransferFailed(FailureKind::Access),
            DriverError::NotSupported => TransferError::TransferFailed(FailureKind::NotSupported),
            DriverError::NotFound | DriverError::Interrupted | DriverError::Other => {
                TransferError::TransferFailed(FailureKind::Other)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// Translate a completed transfer into a byte count or error
///
/// With `short_read_on_timeout`, a transfer that timed out or was cancelled
/// after moving some bytes still counts as a (short) success.
pub fn translate_status(
    status: TransferStatus,
    actual_length: usize,
    short_read_on_timeout: bool,
) -> Result<usize> {
    match status {
        TransferStatus::Completed => Ok(actual_length),
        TransferStatus::TimedOut | TransferStatus::Cancelled => {
            if short_read_on_timeout && actual_length > 0 {
                Ok(actual_length)
            } else {
                Err(TransferError::Timeout)
            }
        }
        TransferStatus::Stall => Err(TransferError::TransferFailed(FailureKind::Stall)),
        TransferStatus::NoDevice => Err(TransferError::NoDevice),
        TransferStatus::Overflow => Err(TransferError::TransferFailed(FailureKind::Overflow)),
        TransferStatus::Error => Err(TransferError::TransferFailed(FailureKind::Other)),
    }
}
