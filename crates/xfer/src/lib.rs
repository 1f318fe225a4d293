//! USB host transfer engine
//!
//! Synchronous and asynchronous bulk, interrupt and isochronous transfers
//! over libusb, with reusable reference-counted transfer contexts and a
//! background event thread that polls only while transfers are in flight.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use xfer::libusb::{LibusbDevice, LibusbEvents};
//! use xfer::{Session, SessionOptions, TransferContext};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let events = Arc::new(LibusbEvents::new()?);
//! let handle = rusb::UsbContext::open_device_with_vid_pid(events.context(), 0x0666, 0x0001)
//!     .ok_or("device not found")?;
//! let device = Arc::new(LibusbDevice::new(handle));
//! let session = Session::new(events, SessionOptions::default());
//!
//! let ctx = TransferContext::bulk(&session, device, 0x81)?;
//! ctx.submit(vec![0u8; 4096], 4096, Duration::from_secs(1))?;
//! let read = ctx.reap(Some(Duration::from_secs(1)), true)?;
//! println!("read {} bytes", read);
//! # Ok(())
//! # }
//! ```

mod async_io;
pub mod context;
pub mod driver;
pub mod error;
pub mod event_thread;
pub mod libusb;
pub mod session;
mod sync_io;
pub mod test_utils;

pub use context::TransferContext;
pub use driver::{DeviceIo, EndpointKind, EventDispatch, MAX_ISO_PACKETS};
pub use error::{DriverError, FailureKind, Result, TransferError, TransferStatus};
pub use event_thread::{EventThread, EventThreadState};
pub use session::{Session, SessionOptions};
