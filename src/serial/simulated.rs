//! In-process stand-in for a USB host with a pH meter attached.
//!
//! Used by the test-suite and by `phmeter --simulate`. Devices can be attached and
//! detached at runtime; every change is announced through the monitor handed out by
//! [`UsbHost::port_monitor`], the same way the platform monitors announce real ports.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    DeviceConnection, DeviceDescriptor, LineSettings, PortIo, Result, SerialDriver, SerialError,
    UsbHost,
};
use crate::device::port_monitor::{PortEvent, PortMonitor};

pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Failure switches for exercising error paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedFaults {
    pub no_driver: bool,
    pub open_fails: bool,
    pub no_port: bool,
    pub parameters_fail: bool,
    pub write_fails: bool,
}

struct SimState {
    devices: Vec<DeviceDescriptor>,
    grant_permission: bool,
    grant_without_access: bool,
    granted: HashSet<String>,
    permission_requests: usize,
    faults: SimulatedFaults,
    responder: Responder,
    response_delay: Duration,
    open_delay: Duration,
    applied: Vec<LineSettings>,
    open_ports: usize,
    exchanges: Vec<(Instant, Instant)>,
    monitor_tx: Option<mpsc::Sender<PortEvent>>,
}

/// Answers any non-empty request with a fixed reading.
pub fn default_responder() -> Responder {
    Arc::new(|request: &[u8]| {
        if request.is_empty() {
            Vec::new()
        } else {
            b"pH 7.00\r\n".to_vec()
        }
    })
}

#[derive(Clone)]
pub struct SimulatedUsbHost {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedUsbHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                devices: Vec::new(),
                grant_permission: true,
                grant_without_access: false,
                granted: HashSet::new(),
                permission_requests: 0,
                faults: SimulatedFaults::default(),
                responder: default_responder(),
                response_delay: Duration::ZERO,
                open_delay: Duration::ZERO,
                applied: Vec::new(),
                open_ports: 0,
                exchanges: Vec::new(),
                monitor_tx: None,
            })),
        }
    }

    pub fn with_device(self, device: DeviceDescriptor) -> Self {
        self.state().devices.push(device);
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn announce(&self, event: PortEvent) {
        if let Some(tx) = &self.state().monitor_tx {
            if let Err(e) = tx.try_send(event) {
                log::warn!("Simulated monitor dropped event: {}", e);
            }
        }
    }

    /// Plug a device in.
    pub fn attach(&self, device: DeviceDescriptor) {
        let name = device.device_name.clone();
        self.state().devices.push(device);
        self.announce(PortEvent::PortAdded(name));
    }

    /// Unplug a device by handle. Returns false if it was not attached.
    pub fn detach(&self, device_name: &str) -> bool {
        let removed = {
            let mut state = self.state();
            let before = state.devices.len();
            state.devices.retain(|d| d.device_name != device_name);
            state.granted.remove(device_name);
            state.devices.len() != before
        };
        if removed {
            self.announce(PortEvent::PortRemoved(device_name.to_string()));
        }
        removed
    }

    pub fn set_permission(&self, grant: bool) {
        self.state().grant_permission = grant;
    }

    /// Answer permission requests with a grant that never makes the device accessible.
    pub fn set_grant_without_access(&self, enabled: bool) {
        self.state().grant_without_access = enabled;
    }

    pub fn set_faults(&self, faults: SimulatedFaults) {
        self.state().faults = faults;
    }

    pub fn set_responder(&self, responder: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) {
        self.state().responder = Arc::new(responder);
    }

    /// Time the instrument takes to answer a request.
    pub fn set_response_delay(&self, delay: Duration) {
        self.state().response_delay = delay;
    }

    /// Time it takes to open a port.
    pub fn set_open_delay(&self, delay: Duration) {
        self.state().open_delay = delay;
    }

    pub fn permission_requests(&self) -> usize {
        self.state().permission_requests
    }

    /// Line settings applied to ports, oldest first.
    pub fn applied_settings(&self) -> Vec<LineSettings> {
        self.state().applied.clone()
    }

    pub fn open_ports(&self) -> usize {
        self.state().open_ports
    }

    /// (write start, read end) of every completed exchange.
    pub fn exchanges(&self) -> Vec<(Instant, Instant)> {
        self.state().exchanges.clone()
    }
}

impl Default for SimulatedUsbHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsbHost for SimulatedUsbHost {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.state().devices.clone())
    }

    fn has_permission(&self, device: &DeviceDescriptor) -> bool {
        self.state().granted.contains(&device.device_name)
    }

    async fn request_permission(&self, device: &DeviceDescriptor) -> bool {
        let mut state = self.state();
        state.permission_requests += 1;
        if state.grant_permission && !state.grant_without_access {
            state.granted.insert(device.device_name.clone());
        }
        state.grant_permission
    }

    fn probe_drivers(&self, device: &DeviceDescriptor) -> Result<Vec<SerialDriver>> {
        let state = self.state();
        if state.faults.no_driver || !state.devices.contains(device) {
            return Ok(Vec::new());
        }
        let ports = if state.faults.no_port {
            Vec::new()
        } else {
            vec![device.device_name.clone()]
        };
        Ok(vec![SerialDriver {
            name: "simulated-cdc".to_string(),
            device: device.clone(),
            ports,
        }])
    }

    fn open_device(&self, device: &DeviceDescriptor) -> Option<DeviceConnection> {
        let state = self.state();
        if state.faults.open_fails || !state.devices.contains(device) {
            return None;
        }
        Some(DeviceConnection {
            device: device.clone(),
        })
    }

    fn open_port(&self, connection: &DeviceConnection, port_name: &str) -> Result<Box<dyn PortIo>> {
        let delay = self.state().open_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state();
        if !state.devices.contains(&connection.device) {
            return Err(SerialError::PortNotFound(port_name.to_string()));
        }
        state.open_ports += 1;
        Ok(Box::new(SimulatedPort {
            host: self.clone(),
            open: true,
            pending: Vec::new(),
            started: None,
        }))
    }

    fn port_monitor(&self) -> Box<dyn PortMonitor> {
        let (tx, rx) = mpsc::channel(100);
        self.state().monitor_tx = Some(tx);
        Box::new(SimulatedMonitor {
            host: self.clone(),
            rx: Some(rx),
        })
    }
}

struct SimulatedPort {
    host: SimulatedUsbHost,
    open: bool,
    pending: Vec<u8>,
    started: Option<Instant>,
}

impl SimulatedPort {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(SerialError::PortClosed)
        }
    }
}

impl PortIo for SimulatedPort {
    fn set_parameters(&mut self, settings: &LineSettings) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.host.state();
        if state.faults.parameters_fail {
            return Err(SerialError::IoError(io::Error::new(
                io::ErrorKind::InvalidInput,
                "line parameters rejected",
            )));
        }
        state.applied.push(*settings);
        Ok(())
    }

    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        self.ensure_open()?;
        self.started = Some(Instant::now());
        let (responder, delay) = {
            let state = self.host.state();
            if state.faults.write_fails {
                return Err(SerialError::IoError(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "device stopped responding",
                )));
            }
            (state.responder.clone(), state.response_delay)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.pending = responder(data);
        Ok(data.len())
    }

    fn read(&mut self, buffer: &mut [u8], _timeout: Duration) -> Result<usize> {
        self.ensure_open()?;
        let count = self.pending.len().min(buffer.len());
        buffer[..count].copy_from_slice(&self.pending[..count]);
        self.pending.drain(..count);

        if let Some(started) = self.started.take() {
            self.host.state().exchanges.push((started, Instant::now()));
        }
        Ok(count)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            let mut state = self.host.state();
            state.open_ports = state.open_ports.saturating_sub(1);
        }
        Ok(())
    }
}

struct SimulatedMonitor {
    host: SimulatedUsbHost,
    rx: Option<mpsc::Receiver<PortEvent>>,
}

#[async_trait]
impl PortMonitor for SimulatedMonitor {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.host.state().monitor_tx = None;
        Ok(())
    }

    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.rx.take()
    }
}
