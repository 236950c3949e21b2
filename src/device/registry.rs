use std::sync::Arc;

use super::{DeviceFilter, Result};
use crate::serial::{DeviceDescriptor, UsbHost};

/// Outcome of running the selection policy over a device list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub candidate: Option<DeviceDescriptor>,
    pub rejected: Vec<DeviceDescriptor>,
}

pub fn is_excluded(device: &DeviceDescriptor, excluded: &[DeviceFilter]) -> bool {
    excluded.iter().any(|filter| filter.matches(device))
}

/// Pick the device to connect to.
///
/// Devices are ordered by handle and the first one not matching an exclusion filter
/// wins, so the choice does not depend on the order the OS enumerates devices in.
pub fn select_candidate(devices: &[DeviceDescriptor], excluded: &[DeviceFilter]) -> Selection {
    let mut ordered: Vec<&DeviceDescriptor> = devices.iter().collect();
    ordered.sort_by(|a, b| a.device_name.cmp(&b.device_name));

    let mut selection = Selection::default();
    for device in ordered {
        if is_excluded(device, excluded) {
            selection.rejected.push(device.clone());
        } else if selection.candidate.is_none() {
            selection.candidate = Some(device.clone());
        }
    }
    selection
}

/// Device discovery against a [`UsbHost`].
pub struct DeviceRegistry {
    host: Arc<dyn UsbHost>,
    excluded: Vec<DeviceFilter>,
}

impl DeviceRegistry {
    pub fn new(host: Arc<dyn UsbHost>, excluded: Vec<DeviceFilter>) -> Self {
        Self { host, excluded }
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.host.list_devices()?)
    }

    pub fn select(&self) -> Result<Selection> {
        let devices = self.list_devices()?;
        log::debug!("Selecting among {} attached device(s)", devices.len());
        Ok(select_candidate(&devices, &self.excluded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(name: &str, pid: u16) -> DeviceDescriptor {
        DeviceDescriptor::new(name, 0x1d6b, pid)
    }

    fn meter(name: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(name, 0x0403, 0x6001)
    }

    fn filters() -> Vec<DeviceFilter> {
        vec![DeviceFilter::root_hubs()]
    }

    #[test]
    fn empty_list_has_no_candidate() {
        let selection = select_candidate(&[], &filters());
        assert_eq!(selection, Selection::default());
    }

    #[test]
    fn only_hubs_yields_nothing() {
        let devices = [hub("usb1", 0x0001), hub("usb2", 0x0002), hub("usb3", 0x0003)];
        let selection = select_candidate(&devices, &filters());
        assert!(selection.candidate.is_none());
        assert_eq!(selection.rejected.len(), 3);
    }

    #[test]
    fn non_excluded_device_is_always_found() {
        let devices = [hub("usb1", 0x0002), meter("/dev/ttyUSB0"), hub("usb2", 0x0003)];
        let selection = select_candidate(&devices, &filters());
        assert_eq!(selection.candidate, Some(meter("/dev/ttyUSB0")));
        assert_eq!(selection.rejected.len(), 2);
    }

    #[test]
    fn hub_vendor_with_other_product_is_accepted() {
        let devices = [hub("usb9", 0x0104)];
        let selection = select_candidate(&devices, &filters());
        assert_eq!(selection.candidate, Some(hub("usb9", 0x0104)));
        assert!(selection.rejected.is_empty());
    }

    #[test]
    fn first_by_handle_wins_regardless_of_order() {
        let forward = [meter("/dev/ttyUSB0"), meter("/dev/ttyUSB1")];
        let reverse = [meter("/dev/ttyUSB1"), meter("/dev/ttyUSB0")];
        assert_eq!(
            select_candidate(&forward, &filters()).candidate,
            select_candidate(&reverse, &filters()).candidate
        );
        assert_eq!(
            select_candidate(&reverse, &filters()).candidate.unwrap().device_name,
            "/dev/ttyUSB0"
        );
    }

    #[test]
    fn no_filters_accepts_hubs() {
        let devices = [hub("usb1", 0x0001)];
        assert!(select_candidate(&devices, &[]).candidate.is_some());
    }
}
