//! Vendor requests understood by the benchmark firmware

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use xfer::{DeviceIo, Session, TransferError};

pub const SET_TEST: u8 = 0x0E;
pub const GET_TEST: u8 = 0x0F;

/// Vendor, device recipient, device-to-host
const REQUEST_TYPE: u8 = 0xC0;
const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// What the firmware does with its endpoints
///
/// The discriminants are the values sent in SET_TEST; bit 0 means the host
/// reads and bit 1 means the host writes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TestType {
    None = 0,
    Read = 1,
    Write = 2,
    #[default]
    Loop = 3,
}

impl TestType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TestType::None),
            1 => Some(TestType::Read),
            2 => Some(TestType::Write),
            3 => Some(TestType::Loop),
            _ => None,
        }
    }

    pub fn reads(self) -> bool {
        self as u8 & TestType::Read as u8 != 0
    }

    pub fn writes(self) -> bool {
        self as u8 & TestType::Write as u8 != 0
    }
}

impl std::fmt::Display for TestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestType::None => f.write_str("None"),
            TestType::Read => f.write_str("Read"),
            TestType::Write => f.write_str("Write"),
            TestType::Loop => f.write_str("Loop"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    #[error("Control request failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Expected a 1 byte reply, got {0} bytes")]
    UnexpectedLength(usize),

    #[error("Unknown test type {0}")]
    UnknownTestType(u8),
}

/// Select the firmware's test type for `interface`
pub fn set_test_type(
    session: &Session,
    device: &dyn DeviceIo,
    interface: u8,
    test_type: TestType,
) -> Result<(), FirmwareError> {
    let mut reply = [0u8; 1];
    let len = session.control_msg(
        device,
        REQUEST_TYPE,
        SET_TEST,
        test_type as u16,
        u16::from(interface),
        &mut reply,
        CONTROL_TIMEOUT,
    )?;
    if len != 1 {
        return Err(FirmwareError::UnexpectedLength(len));
    }
    debug!("Firmware test type set to {} on interface {}", test_type, interface);
    Ok(())
}

/// Read back the firmware's current test type
pub fn get_test_type(
    session: &Session,
    device: &dyn DeviceIo,
    interface: u8,
) -> Result<TestType, FirmwareError> {
    let mut reply = [0u8; 1];
    let len = session.control_msg(
        device,
        REQUEST_TYPE,
        GET_TEST,
        0,
        u16::from(interface),
        &mut reply,
        CONTROL_TIMEOUT,
    )?;
    if len != 1 {
        return Err(FirmwareError::UnexpectedLength(len));
    }
    TestType::from_u8(reply[0]).ok_or(FirmwareError::UnknownTestType(reply[0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use xfer::DriverError;
    use xfer::test_utils::{MockDevice, MockEvents};

    fn setup() -> (Session, MockDevice) {
        let events = Arc::new(MockEvents::new());
        let device = MockDevice::new(&events);
        (Session::new(events, Default::default()), device)
    }

    #[test]
    fn test_directions() {
        assert!(TestType::Read.reads());
        assert!(!TestType::Read.writes());
        assert!(TestType::Write.writes());
        assert!(TestType::Loop.reads() && TestType::Loop.writes());
        assert!(!TestType::None.reads() && !TestType::None.writes());
    }

    #[test]
    fn test_set_test_type_request() {
        let (session, device) = setup();
        device.set_control_response(&[1]);
        set_test_type(&session, &device, 2, TestType::Write).unwrap();

        let requests = device.control_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_type, 0xC0);
        assert_eq!(requests[0].request, SET_TEST);
        assert_eq!(requests[0].value, 2);
        assert_eq!(requests[0].index, 2);
    }

    #[test]
    fn test_set_test_type_short_reply() {
        let (session, device) = setup();
        device.set_control_response(&[]);
        assert!(matches!(
            set_test_type(&session, &device, 0, TestType::Loop),
            Err(FirmwareError::UnexpectedLength(0))
        ));
    }

    #[test]
    fn test_get_test_type() {
        let (session, device) = setup();
        device.set_control_response(&[3]);
        assert_eq!(get_test_type(&session, &device, 0).unwrap(), TestType::Loop);

        device.set_control_response(&[9]);
        assert!(matches!(
            get_test_type(&session, &device, 0),
            Err(FirmwareError::UnknownTestType(9))
        ));
    }

    #[test]
    fn test_control_failure() {
        let (session, device) = setup();
        device.set_control_error(Some(DriverError::Pipe));
        assert!(matches!(
            set_test_type(&session, &device, 0, TestType::Read),
            Err(FirmwareError::Transfer(_))
        ));
    }
}
