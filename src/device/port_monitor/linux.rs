use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{PortEvent, PortMonitor};
use crate::serial::{Result, SerialError};

const RECEIVE_INTERVAL: Duration = Duration::from_millis(50);

/// udev-backed monitor for the tty subsystem.
pub struct LinuxPortMonitor {
    tx: Option<mpsc::Sender<PortEvent>>,
    rx: Option<mpsc::Receiver<PortEvent>>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl LinuxPortMonitor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(100);

        Self {
            tx: Some(tx),
            rx: Some(rx),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    fn extract_port_name(device: &libudev::Device) -> Option<String> {
        // Only USB serial adapters: /dev/ttyUSB* and /dev/ttyACM*
        let devnode = device.devnode()?.to_str()?;
        if devnode.starts_with("/dev/ttyUSB") || devnode.starts_with("/dev/ttyACM") {
            Some(devnode.to_string())
        } else {
            None
        }
    }

    fn watch(
        tx: mpsc::Sender<PortEvent>,
        running: Arc<AtomicBool>,
    ) -> std::result::Result<(), libudev::Error> {
        let context = libudev::Context::new()?;
        let mut monitor = libudev::Monitor::new(&context)?;
        monitor.match_subsystem("tty")?;
        let mut socket = monitor.listen()?;

        while running.load(Ordering::SeqCst) {
            let event = match socket.receive_event() {
                Some(event) => event,
                None => {
                    std::thread::sleep(RECEIVE_INTERVAL);
                    continue;
                }
            };

            let Some(port_name) = Self::extract_port_name(event.device()) else {
                continue;
            };

            let port_event = match event.event_type() {
                libudev::EventType::Add => PortEvent::PortAdded(port_name),
                libudev::EventType::Remove => PortEvent::PortRemoved(port_name),
                _ => continue,
            };

            log::debug!("udev: {:?}", port_event);
            if let Err(e) = tx.blocking_send(port_event) {
                log::error!("Failed to send port event: {}", e);
                break;
            }
        }

        Ok(())
    }
}

impl Drop for LinuxPortMonitor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Default for LinuxPortMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortMonitor for LinuxPortMonitor {
    async fn start(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SerialError::MonitorError("Already started".to_string()))?;
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        // The udev context is not Send, so it lives entirely on this thread.
        let handle = std::thread::Builder::new()
            .name("udev-port-monitor".to_string())
            .spawn(move || {
                if let Err(e) = Self::watch(tx, running) {
                    log::error!("udev port monitor failed: {}", e);
                }
                log::info!("Linux port monitor stopped");
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| SerialError::MonitorError(e.to_string()))?
                .map_err(|_| SerialError::MonitorError("udev thread panicked".to_string()))?;
        }

        Ok(())
    }

    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.rx.take()
    }
}
