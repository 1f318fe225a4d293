//! Benchmark device discovery and setup

use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::sync::Arc;
use tracing::{debug, warn};
use xfer::libusb::LibusbDevice;
use xfer::{DeviceIo, EndpointKind};

/// Configuration selected before claiming the interface
const BENCH_CONFIGURATION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device {vid:04X}:{pid:04X} not found")]
    NotFound { vid: u16, pid: u16 },

    #[error("Interface {interface} (alt setting {alt_setting}) not found")]
    InterfaceNotFound { interface: u8, alt_setting: u8 },

    #[error("Device {vid:04X}:{pid:04X} has no interfaces")]
    NoInterfaces { vid: u16, pid: u16 },

    #[error("Failed locating EP{0:02X}h")]
    EndpointNotFound(u8),

    #[error(
        "Buffer size {buffer_size} is not a multiple of EP{endpoint:02X}h maximum packet size of {max_packet_size}"
    )]
    BufferSize {
        buffer_size: usize,
        endpoint: u8,
        max_packet_size: u16,
    },

    #[error("No devices were found")]
    NoDevices,

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

/// Endpoint of the benchmark interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub kind: EndpointKind,
    /// Raw wMaxPacketSize, including the high-bandwidth bits
    pub max_packet_size: u16,
}

impl EndpointInfo {
    pub fn is_in(&self) -> bool {
        xfer::driver::is_in_endpoint(self.address)
    }

    /// Bytes per transaction
    pub fn packet_bytes(&self) -> u16 {
        self.max_packet_size & 0x7FF
    }

    /// Transactions per microframe
    pub fn transactions(&self) -> u16 {
        ((self.max_packet_size & 0x1800) >> 11) + 1
    }
}

/// Pick the endpoint to test
///
/// With no endpoint number in `requested` (just the direction bit) the first
/// endpoint of that direction is used; otherwise the address must match
/// exactly.
pub fn select_endpoint(endpoints: &[EndpointInfo], requested: u8) -> Result<EndpointInfo, DeviceError> {
    let found = if requested & 0x0F == 0 {
        endpoints
            .iter()
            .find(|ep| ep.address & 0x80 == requested & 0x80)
    } else {
        endpoints.iter().find(|ep| ep.address == requested)
    };
    found.copied().ok_or(DeviceError::EndpointNotFound(requested))
}

pub fn check_buffer_size(buffer_size: usize, endpoint: &EndpointInfo) -> Result<(), DeviceError> {
    let max_packet_size = endpoint.max_packet_size;
    if max_packet_size == 0 || buffer_size % usize::from(max_packet_size) != 0 {
        return Err(DeviceError::BufferSize {
            buffer_size,
            endpoint: endpoint.address,
            max_packet_size,
        });
    }
    Ok(())
}

/// Non-control endpoints of `interface`/`alt_setting` in the first configuration
pub fn interface_endpoints(
    device: &Device<Context>,
    interface: u8,
    alt_setting: u8,
) -> Option<Vec<EndpointInfo>> {
    let config = device.config_descriptor(0).ok()?;
    let descriptor = config
        .interfaces()
        .filter(|i| i.number() == interface)
        .flat_map(|i| i.descriptors())
        .find(|d| d.setting_number() == alt_setting)?;

    Some(
        descriptor
            .endpoint_descriptors()
            .filter_map(|ep| {
                EndpointKind::from_transfer_type(ep.transfer_type()).map(|kind| EndpointInfo {
                    address: ep.address(),
                    kind,
                    max_packet_size: ep.max_packet_size(),
                })
            })
            .collect(),
    )
}

fn first_interface(device: &Device<Context>) -> Option<u8> {
    let config = device.config_descriptor(0).ok()?;
    config.interfaces().next().map(|i| i.number())
}

/// An opened benchmark device
pub struct BenchDevice {
    io: Arc<LibusbDevice>,
    pub vid: u16,
    pub pid: u16,
    pub interface: u8,
    pub alt_setting: u8,
    pub endpoints: Vec<EndpointInfo>,
}

impl BenchDevice {
    /// Open the first `vid`/`pid` device that has the interface
    pub fn open(
        context: &Context,
        vid: u16,
        pid: u16,
        interface: u8,
        alt_setting: u8,
    ) -> Result<Self, DeviceError> {
        for device in context.devices()?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != vid || desc.product_id() != pid {
                continue;
            }
            let Some(endpoints) = interface_endpoints(&device, interface, alt_setting) else {
                debug!(
                    "Device {:04X}:{:04X} on bus {} lacks interface {}/{}",
                    vid,
                    pid,
                    device.bus_number(),
                    interface,
                    alt_setting
                );
                continue;
            };
            match device.open() {
                Ok(handle) => {
                    return Ok(Self::from_handle(
                        handle,
                        vid,
                        pid,
                        interface,
                        alt_setting,
                        endpoints,
                    ));
                }
                Err(e) => warn!("Failed to open device {:04X}:{:04X}: {}", vid, pid, e),
            }
        }
        Err(DeviceError::NotFound { vid, pid })
    }

    /// Open a device picked from [`list_devices`]
    ///
    /// Falls back to the first interface when the requested one is missing.
    pub fn open_listed(
        listing: &DeviceListing,
        interface: u8,
        alt_setting: u8,
    ) -> Result<Self, DeviceError> {
        let (interface, alt_setting, endpoints) =
            match interface_endpoints(&listing.device, interface, alt_setting) {
                Some(endpoints) => (interface, alt_setting, endpoints),
                None => {
                    let first = first_interface(&listing.device).ok_or(
                        DeviceError::NoInterfaces {
                            vid: listing.vid,
                            pid: listing.pid,
                        },
                    )?;
                    let endpoints = interface_endpoints(&listing.device, first, 0).ok_or(
                        DeviceError::InterfaceNotFound {
                            interface: first,
                            alt_setting: 0,
                        },
                    )?;
                    debug!("Using first interface {} instead of {}", first, interface);
                    (first, 0, endpoints)
                }
            };

        let handle = listing.device.open()?;
        Ok(Self::from_handle(
            handle,
            listing.vid,
            listing.pid,
            interface,
            alt_setting,
            endpoints,
        ))
    }

    fn from_handle(
        handle: DeviceHandle<Context>,
        vid: u16,
        pid: u16,
        interface: u8,
        alt_setting: u8,
        endpoints: Vec<EndpointInfo>,
    ) -> Self {
        debug!("Opened device {:04X}:{:04X}", vid, pid);
        Self {
            io: Arc::new(LibusbDevice::new(handle)),
            vid,
            pid,
            interface,
            alt_setting,
            endpoints,
        }
    }

    pub fn io(&self) -> Arc<dyn DeviceIo> {
        self.io.clone()
    }

    /// Select configuration 1, claim the interface, select the alt setting
    pub fn configure(&self) -> Result<(), DeviceError> {
        let handle = self.io.handle();

        handle.set_active_configuration(BENCH_CONFIGURATION)?;

        match handle.kernel_driver_active(self.interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", self.interface);
                if let Err(e) = handle.detach_kernel_driver(self.interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        self.interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                self.interface, e
            ),
        }

        handle.claim_interface(self.interface)?;
        handle.set_alternate_setting(self.interface, self.alt_setting)?;
        if self.alt_setting > 0 {
            debug!(
                "Selected alternate setting {} on interface {}",
                self.alt_setting, self.interface
            );
        }
        Ok(())
    }

    pub fn release(&self) {
        if let Err(e) = self.io.handle().release_interface(self.interface) {
            debug!("Failed to release interface {}: {}", self.interface, e);
        }
    }
}

/// A connected device as shown in list mode
pub struct DeviceListing {
    pub device: Device<Context>,
    pub vid: u16,
    pub pid: u16,
    /// "(manufacturer) product [serial]" as far as the strings are readable
    pub description: String,
}

impl std::fmt::Display for DeviceListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}:{:04X} {}", self.vid, self.pid, self.description)
    }
}

/// Every device that can be opened, with its string descriptors
pub fn list_devices(context: &Context) -> Result<Vec<DeviceListing>, DeviceError> {
    let mut listings = Vec::new();
    for device in context.devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        let Ok(handle) = device.open() else {
            continue;
        };

        let read = |index: Option<u8>| {
            index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        };
        let mut description = String::new();
        if let Some(manufacturer) = read(desc.manufacturer_string_index()) {
            description.push_str(&format!("({}) ", manufacturer));
        }
        if let Some(product) = read(desc.product_string_index()) {
            description.push_str(&format!("{} ", product));
        }
        if let Some(serial) = read(desc.serial_number_string_index()) {
            description.push_str(&format!("[{}] ", serial));
        }

        listings.push(DeviceListing {
            vid: desc.vendor_id(),
            pid: desc.product_id(),
            description: description.trim_end().to_string(),
            device,
        });
    }

    if listings.is_empty() {
        return Err(DeviceError::NoDevices);
    }
    Ok(listings)
}
