#![allow(dead_code)]

use std::time::Duration;

use phmeter_serial_lib::events::{self, HostEvent};
use phmeter_serial_lib::{
    ConnectionManager, DeviceDescriptor, ManagerSettings, Notifier, ServiceState, SimulatedUsbHost,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const PORT: &str = "/dev/ttyUSB0";
const WAIT: Duration = Duration::from_secs(3);

pub fn meter(name: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(name, 0x0403, 0x6001)
}

pub fn fast_settings() -> ManagerSettings {
    ManagerSettings {
        settle_delay_ms: 50,
        ..ManagerSettings::default()
    }
}

pub struct Harness {
    pub host: SimulatedUsbHost,
    pub manager: ConnectionManager,
    pub events: UnboundedReceiver<HostEvent>,
}

impl Harness {
    pub fn new(host: SimulatedUsbHost, settings: ManagerSettings) -> Self {
        let (sink, events) = events::channel();
        let manager = ConnectionManager::new(
            std::sync::Arc::new(host.clone()),
            Notifier::new(sink),
            settings,
        );
        Self {
            host,
            manager,
            events,
        }
    }

    /// A harness with one meter plugged in.
    pub fn with_meter() -> Self {
        Self::new(SimulatedUsbHost::new().with_device(meter(PORT)), fast_settings())
    }

    /// Start the service, open a session with the given profile and discard the events so far.
    pub async fn connected(baud_rate: i32, data_bits: i32) -> Self {
        let mut harness = Self::with_meter();
        harness.manager.start_service().await;
        harness.manager.connect(baud_rate, data_bits).await;
        assert!(harness.wait_open(true).await, "session did not open");
        harness.drain();
        harness
    }

    pub async fn wait_open(&self, open: bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.manager.is_open().await == open {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub async fn wait_state(&self, state: ServiceState) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.manager.state().await == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    /// Wait for the next event with the given name, skipping others.
    pub async fn wait_event(&mut self, name: &str) -> Option<HostEvent> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv()).await.ok()??;
            if event.name == name {
                return Some(event);
            }
        }
    }

    pub fn drain(&mut self) -> Vec<HostEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

pub fn error_titles(events: &[HostEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.name == events::ON_ERROR)
        .map(|e| e.payload["title"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
