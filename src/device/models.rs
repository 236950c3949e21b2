use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity, StopBits};
use uuid::Uuid;

use super::{DeviceError, Result};
use crate::serial::{DeviceDescriptor, LineSettings};

// Linux Foundation root hubs (USB 1.1, 2.0 and 3.0)
pub const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;
pub const ROOT_HUB_PRODUCT_IDS: [u16; 3] = [0x0001, 0x0002, 0x0003];

pub const DEFAULT_BAUD_RATE: u32 = 4800;

/// Externally visible state of the connection manager
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Idle,
    Connecting,
    Connected,
}

/// Notifications funnelled into the connection manager, handled in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbAction {
    /// A device appeared; carries its handle when the source knows it
    Attached(Option<String>),
    /// A device went away
    Detached(Option<String>),
    /// The settling delay after a detach expired without a matching attach
    DetachSettled(Option<String>),
    PermissionResult { granted: bool },
}

/// Line configuration: an explicit profile plus the auto-connect override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub auto_connect: bool,
    pub auto_connect_baud_rate: u32,
    pub auto_connect_data_bits: DataBits,
}

impl ConnectionConfig {
    /// Reset data bits, stop bits and parity to 8N1. Baud rates are left alone.
    pub fn load_defaults(&mut self) {
        self.data_bits = DataBits::Eight;
        self.stop_bits = StopBits::One;
        self.parity = Parity::None;
    }

    /// The parameters a session opened now would use.
    pub fn line_settings(&self) -> LineSettings {
        let (baud_rate, data_bits) = if self.auto_connect {
            (self.auto_connect_baud_rate, self.auto_connect_data_bits)
        } else {
            (self.baud_rate, self.data_bits)
        };

        LineSettings {
            baud_rate,
            data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            auto_connect: false,
            auto_connect_baud_rate: DEFAULT_BAUD_RATE,
            auto_connect_data_bits: DataBits::Eight,
        }
    }
}

/// Devices matching the vendor id and any of the product ids are never selected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_ids: Vec<u16>,
}

impl DeviceFilter {
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        device.vendor_id == self.vendor_id && self.product_ids.contains(&device.product_id)
    }

    pub fn root_hubs() -> Self {
        Self {
            vendor_id: ROOT_HUB_VENDOR_ID,
            product_ids: ROOT_HUB_PRODUCT_IDS.to_vec(),
        }
    }
}

/// Tuning knobs for the manager. Read once at construction, never written back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerSettings {
    pub settle_delay_ms: u64,
    pub transaction_timeout_ms: u64,
    pub read_buffer_size: usize,
    pub poll_interval_ms: u64,
    pub excluded_devices: Vec<DeviceFilter>,
}

impl ManagerSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&raw)
            .map_err(|e| DeviceError::InvalidConfiguration(format!("{}: {}", path.display(), e)))?;

        if settings.read_buffer_size == 0 {
            return Err(DeviceError::InvalidConfiguration(
                "read_buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(settings)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2000,
            transaction_timeout_ms: 1000,
            read_buffer_size: 64,
            poll_interval_ms: 500,
            excluded_devices: vec![DeviceFilter::root_hubs()],
        }
    }
}

/// Snapshot of an open session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub device: DeviceDescriptor,
    pub line: LineSettings,
    pub connected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_settings_follow_mode() {
        let mut config = ConnectionConfig {
            baud_rate: 9600,
            data_bits: DataBits::Seven,
            auto_connect_baud_rate: 19200,
            auto_connect_data_bits: DataBits::Six,
            parity: Parity::Even,
            ..ConnectionConfig::default()
        };

        let explicit = config.line_settings();
        assert_eq!(explicit.baud_rate, 9600);
        assert_eq!(explicit.data_bits, DataBits::Seven);
        assert_eq!(explicit.parity, Parity::Even);

        config.auto_connect = true;
        let auto = config.line_settings();
        assert_eq!(auto.baud_rate, 19200);
        assert_eq!(auto.data_bits, DataBits::Six);
        assert_eq!(auto.parity, Parity::Even);
    }

    #[test]
    fn load_defaults_keeps_baud_rate() {
        let mut config = ConnectionConfig {
            baud_rate: 115200,
            data_bits: DataBits::Five,
            stop_bits: StopBits::Two,
            parity: Parity::Odd,
            ..ConnectionConfig::default()
        };
        config.load_defaults();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.parity, Parity::None);
    }

    #[test]
    fn root_hub_filter_requires_vendor_and_product() {
        let filter = DeviceFilter::root_hubs();
        assert!(filter.matches(&DeviceDescriptor::new("hub", 0x1d6b, 0x0002)));
        assert!(!filter.matches(&DeviceDescriptor::new("other", 0x1d6b, 0x0104)));
        assert!(!filter.matches(&DeviceDescriptor::new("ftdi", 0x0403, 0x0001)));
    }

    #[test]
    fn partial_settings_fall_back_to_defaults() {
        let settings: ManagerSettings = serde_json::from_str(r#"{ "settle_delay_ms": 250 }"#).unwrap();
        assert_eq!(settings.settle_delay(), Duration::from_millis(250));
        assert_eq!(settings.read_buffer_size, 64);
        assert_eq!(settings.excluded_devices, vec![DeviceFilter::root_hubs()]);
    }
}
