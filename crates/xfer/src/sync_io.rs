//! Blocking transfers
//!
//! The baseline path the asynchronous engine is measured against. Endpoint
//! addresses with the wrong direction bit are corrected (with a warning)
//! rather than rejected, and a timed out transfer that moved data reports a
//! short transfer when the session's `short_read_on_timeout` is set.

use crate::driver::{DeviceIo, ENDPOINT_IN, RawOutcome};
use crate::error::{DriverError, Result, TransferError};
use crate::session::Session;
use std::time::Duration;
use tracing::warn;

fn read_endpoint(endpoint: u8) -> u8 {
    if endpoint & ENDPOINT_IN == 0 {
        warn!(
            "Read from endpoint {:#04x} without the IN bit; using {:#04x}",
            endpoint,
            endpoint | ENDPOINT_IN
        );
    }
    endpoint | ENDPOINT_IN
}

fn write_endpoint(endpoint: u8) -> u8 {
    if endpoint & ENDPOINT_IN != 0 {
        warn!(
            "Write to endpoint {:#04x} with the IN bit; using {:#04x}",
            endpoint,
            endpoint & !ENDPOINT_IN
        );
    }
    endpoint & !ENDPOINT_IN
}

fn finish(outcome: RawOutcome, short_read_on_timeout: bool) -> Result<usize> {
    match outcome.result {
        Ok(()) => Ok(outcome.actual_length),
        Err(DriverError::Timeout) if short_read_on_timeout && outcome.actual_length > 0 => {
            Ok(outcome.actual_length)
        }
        Err(e) => Err(TransferError::from(e)),
    }
}

impl Session {
    pub fn bulk_read(
        &self,
        device: &dyn DeviceIo,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let outcome = device.read_bulk(read_endpoint(endpoint), data, timeout);
        finish(outcome, self.short_read_on_timeout())
    }

    pub fn bulk_write(
        &self,
        device: &dyn DeviceIo,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let outcome = device.write_bulk(write_endpoint(endpoint), data, timeout);
        finish(outcome, self.short_read_on_timeout())
    }

    pub fn interrupt_read(
        &self,
        device: &dyn DeviceIo,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let outcome = device.read_interrupt(read_endpoint(endpoint), data, timeout);
        finish(outcome, self.short_read_on_timeout())
    }

    pub fn interrupt_write(
        &self,
        device: &dyn DeviceIo,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let outcome = device.write_interrupt(write_endpoint(endpoint), data, timeout);
        finish(outcome, self.short_read_on_timeout())
    }

    /// Control transfer on endpoint 0; returns the bytes transferred
    #[allow(clippy::too_many_arguments)]
    pub fn control_msg(
        &self,
        device: &dyn DeviceIo,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        device
            .control_transfer(request_type, request, value, index, data, timeout)
            .map_err(TransferError::from)
    }
}
