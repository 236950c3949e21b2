use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::UsbAction;
use crate::serial::{DeviceDescriptor, UsbHost};

/// Asks the host for access to a device and reports the answer as a
/// [`UsbAction::PermissionResult`] on the manager's action stream.
#[derive(Clone)]
pub struct PermissionGate {
    host: Arc<dyn UsbHost>,
}

impl PermissionGate {
    pub fn new(host: Arc<dyn UsbHost>) -> Self {
        Self { host }
    }

    pub fn request(&self, device: DeviceDescriptor, actions: mpsc::UnboundedSender<UsbAction>) -> JoinHandle<()> {
        let host = self.host.clone();
        tokio::spawn(async move {
            log::info!("Requesting USB permission for {}", device.device_name);
            let mut granted = host.request_permission(&device).await;
            if granted {
                // The access check may open the device node.
                let check_host = host.clone();
                let check_device = device.clone();
                granted = tokio::task::spawn_blocking(move || check_host.has_permission(&check_device))
                    .await
                    .unwrap_or(false);
                if !granted {
                    log::warn!("Permission for {} was granted but the device is still not accessible", device.device_name);
                }
            }
            log::debug!("Permission for {}: {}", device.device_name, granted);

            if actions.send(UsbAction::PermissionResult { granted }).is_err() {
                log::debug!("Service stopped before the permission result for {} arrived", device.device_name);
            }
        })
    }
}
