//! Common utilities for usb-xfer
//!
//! This crate provides functionality shared by the transfer engine and the
//! benchmark: error handling, logging setup, the event/semaphore primitives
//! the engine synchronizes on, and rate formatting helpers.

pub mod error;
pub mod logging;
pub mod metrics;
pub mod sync;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use sync::{Event, EventMode, Semaphore};
