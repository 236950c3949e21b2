pub mod interface;
pub mod simulated;

pub use interface::{SystemPort, SystemUsbHost};
pub use simulated::{SimulatedFaults, SimulatedUsbHost};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity, StopBits};

use crate::device::port_monitor::PortMonitor;

/// A USB device as reported by the host. Only valid while the device stays attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Opaque handle; the OS port path on desktop hosts.
    pub device_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(device_name: impl Into<String>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            device_name: device_name.into(),
            vendor_id,
            product_id,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}

/// A serial driver that claims a USB device, with the ports it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialDriver {
    pub name: String,
    pub device: DeviceDescriptor,
    pub ports: Vec<String>,
}

/// Low-level handle to an opened USB device. Ports are opened through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConnection {
    pub device: DeviceDescriptor,
}

/// Line parameters applied to an open port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

/// Map a host-supplied data bit count onto the serialport enum.
pub fn data_bits_from(bits: i32) -> Option<DataBits> {
    match bits {
        5 => Some(DataBits::Five),
        6 => Some(DataBits::Six),
        7 => Some(DataBits::Seven),
        8 => Some(DataBits::Eight),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Port is closed")]
    PortClosed,

    #[error("Port monitor error: {0}")]
    MonitorError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// An open serial port. Calls block the current thread, so they belong on a blocking worker.
pub trait PortIo: Send {
    fn set_parameters(&mut self, settings: &LineSettings) -> Result<()>;

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Returns `Ok(0)` when nothing arrived before the timeout.
    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize>;

    fn is_open(&self) -> bool;

    fn close(&mut self) -> Result<()>;
}

/// The OS-side capabilities the connection manager is written against.
///
/// Driver enumeration and permission prompts are platform details; the manager only
/// needs to list devices, obtain access, find a driver, and open a port.
#[async_trait]
pub trait UsbHost: Send + Sync {
    /// Currently attached USB devices.
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    fn has_permission(&self, device: &DeviceDescriptor) -> bool;

    /// Ask for access to the device. Resolves once the OS has answered.
    async fn request_permission(&self, device: &DeviceDescriptor) -> bool;

    /// Serial drivers able to drive the device, best match first.
    fn probe_drivers(&self, device: &DeviceDescriptor) -> Result<Vec<SerialDriver>>;

    /// Open a low-level connection. `None` when the device cannot be opened.
    fn open_device(&self, device: &DeviceDescriptor) -> Option<DeviceConnection>;

    fn open_port(&self, connection: &DeviceConnection, port_name: &str) -> Result<Box<dyn PortIo>>;

    /// A fresh source of attach/detach notifications.
    fn port_monitor(&self) -> Box<dyn PortMonitor>;
}
