use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{SerialPort, SerialPortType, UsbPortInfo};

use super::{
    DeviceConnection, DeviceDescriptor, LineSettings, PortIo, Result, SerialDriver, SerialError,
    UsbHost,
};
use crate::device::port_monitor::{create_port_monitor, PortMonitor};

// Placeholder rate for the open call; the real line parameters are applied right after.
const OPEN_BAUD_RATE: u32 = 9600;
const OPEN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Desktop host backed by the `serialport` crate.
///
/// There is no permission prompt on desktop systems: a device is accessible when its
/// port node can be opened for reading and writing.
pub struct SystemUsbHost {
    poll_interval: Duration,
}

impl SystemUsbHost {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    fn usb_ports() -> Result<Vec<(String, UsbPortInfo)>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(info) => Some((port.port_name, info)),
                _ => None,
            })
            .collect())
    }

    fn port_accessible(device: &DeviceDescriptor) -> bool {
        #[cfg(unix)]
        {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&device.device_name)
                .is_ok()
        }

        #[cfg(not(unix))]
        {
            let _ = device;
            true
        }
    }
}

impl Default for SystemUsbHost {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

fn descriptor_from(port_name: &str, info: &UsbPortInfo) -> DeviceDescriptor {
    DeviceDescriptor {
        device_name: port_name.to_string(),
        vendor_id: info.vid,
        product_id: info.pid,
        serial_number: info.serial_number.clone(),
        manufacturer: info.manufacturer.clone(),
        product: info.product.clone(),
    }
}

fn same_physical_device(device: &DeviceDescriptor, info: &UsbPortInfo) -> bool {
    device.vendor_id == info.vid
        && device.product_id == info.pid
        && device.serial_number == info.serial_number
}

#[async_trait]
impl UsbHost for SystemUsbHost {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(Self::usb_ports()?
            .iter()
            .map(|(name, info)| descriptor_from(name, info))
            .collect())
    }

    fn has_permission(&self, device: &DeviceDescriptor) -> bool {
        Self::port_accessible(device)
    }

    async fn request_permission(&self, device: &DeviceDescriptor) -> bool {
        let device = device.clone();
        let granted = tokio::task::spawn_blocking(move || {
            let granted = Self::port_accessible(&device);
            if !granted {
                log::warn!(
                    "No read/write access to {}; check the user's serial port group membership",
                    device.device_name
                );
            }
            granted
        })
        .await;

        granted.unwrap_or(false)
    }

    fn probe_drivers(&self, device: &DeviceDescriptor) -> Result<Vec<SerialDriver>> {
        let mut ports: Vec<String> = Self::usb_ports()?
            .into_iter()
            .filter(|(_, info)| same_physical_device(device, info))
            .map(|(name, _)| name)
            .collect();

        if ports.is_empty() {
            return Ok(Vec::new());
        }

        // The port the device was selected by goes first.
        ports.sort_by_key(|name| name != &device.device_name);

        Ok(vec![SerialDriver {
            name: device
                .product
                .clone()
                .unwrap_or_else(|| "usb-serial".to_string()),
            device: device.clone(),
            ports,
        }])
    }

    fn open_device(&self, device: &DeviceDescriptor) -> Option<DeviceConnection> {
        match Self::usb_ports() {
            Ok(ports) if ports.iter().any(|(name, _)| name == &device.device_name) => {
                Some(DeviceConnection {
                    device: device.clone(),
                })
            }
            Ok(_) => None,
            Err(e) => {
                log::warn!("Failed to enumerate ports while opening {}: {}", device.device_name, e);
                None
            }
        }
    }

    fn open_port(&self, connection: &DeviceConnection, port_name: &str) -> Result<Box<dyn PortIo>> {
        let port = serialport::new(port_name, OPEN_BAUD_RATE)
            .timeout(OPEN_TIMEOUT)
            .open()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

        log::debug!(
            "Opened {} for device {:04x}:{:04x}",
            port_name,
            connection.device.vendor_id,
            connection.device.product_id
        );
        Ok(Box::new(SystemPort::new(port_name, port)))
    }

    fn port_monitor(&self) -> Box<dyn PortMonitor> {
        create_port_monitor(self.poll_interval)
    }
}

/// A `serialport` handle adapted to [`PortIo`].
pub struct SystemPort {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SystemPort {
    pub fn new(name: &str, port: Box<dyn SerialPort>) -> Self {
        Self {
            name: name.to_string(),
            port: Some(port),
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(SerialError::PortClosed)
    }
}

impl PortIo for SystemPort {
    fn set_parameters(&mut self, settings: &LineSettings) -> Result<()> {
        let port = self.port_mut()?;
        port.set_baud_rate(settings.baud_rate)?;
        port.set_data_bits(settings.data_bits)?;
        port.set_stop_bits(settings.stop_bits)?;
        port.set_parity(settings.parity)?;
        Ok(())
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let port = self.port_mut()?;
        port.set_timeout(timeout)?;
        port.write_all(data)?;
        port.flush()?;
        Ok(data.len())
    }

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port_mut()?;
        port.set_timeout(timeout)?;
        match port.read(buffer) {
            Ok(bytes_read) => Ok(bytes_read),
            Err(ref e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(SerialError::IoError(e)),
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            log::info!("Closing {}", self.name);
            port.flush()?;
        }
        Ok(())
    }
}
