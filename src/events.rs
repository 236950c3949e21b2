//! Status and error events delivered to the host application.
//!
//! Delivery is best effort. A sink that fails is logged and otherwise ignored: the
//! session state never depends on whether the host saw an event.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::device::{DeviceError, Result};

pub const ON_ERROR: &str = "onError";
pub const ON_SERVICE_STARTED: &str = "onServiceStarted";
pub const ON_SERVICE_STOPPED: &str = "onServiceStopped";
pub const ON_DEVICE_ATTACHED: &str = "onDeviceAttached";
pub const ON_DEVICE_DETACHED: &str = "onDeviceDetached";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    Error {
        title: String,
        message: Option<String>,
    },
    ServiceStarted {
        device_attached: bool,
    },
    ServiceStopped,
    DeviceAttached,
    DeviceDetached,
}

impl UsbEvent {
    pub fn error(title: impl Into<String>, message: Option<String>) -> Self {
        Self::Error {
            title: title.into(),
            message,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Error { .. } => ON_ERROR,
            Self::ServiceStarted { .. } => ON_SERVICE_STARTED,
            Self::ServiceStopped => ON_SERVICE_STOPPED,
            Self::DeviceAttached => ON_DEVICE_ATTACHED,
            Self::DeviceDetached => ON_DEVICE_DETACHED,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Error { title, message } => json!({
                "status": false,
                "title": title,
                "message": message,
            }),
            Self::ServiceStarted { device_attached } => json!({ "deviceAttached": device_attached }),
            Self::ServiceStopped | Self::DeviceAttached | Self::DeviceDetached => json!({}),
        }
    }
}

/// An event as the host receives it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostEvent {
    pub name: String,
    pub payload: Value,
}

/// Destination for host events.
pub trait EventSink: Send + Sync {
    fn deliver(&self, name: &str, payload: Value) -> Result<()>;
}

impl<F> EventSink for F
where
    F: Fn(&str, Value) -> Result<()> + Send + Sync,
{
    fn deliver(&self, name: &str, payload: Value) -> Result<()> {
        self(name, payload)
    }
}

/// Forwards events into a tokio channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl EventSink for ChannelSink {
    fn deliver(&self, name: &str, payload: Value) -> Result<()> {
        self.tx
            .send(HostEvent {
                name: name.to_string(),
                payload,
            })
            .map_err(|_| DeviceError::NotificationDelivery("event receiver dropped".to_string()))
    }
}

pub fn channel() -> (ChannelSink, mpsc::UnboundedReceiver<HostEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, rx)
}

/// Writes events to the log. Used when nobody is listening.
pub struct LogSink;

impl EventSink for LogSink {
    fn deliver(&self, name: &str, payload: Value) -> Result<()> {
        log::info!("event {} {}", name, payload);
        Ok(())
    }
}

#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn EventSink>,
}

impl Notifier {
    pub fn new(sink: impl EventSink + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn emit(&self, event: UsbEvent) {
        if let Err(e) = self.sink.deliver(event.name(), event.payload()) {
            log::warn!("Failed to emit {}: {}", event.name(), e);
        }
    }

    pub fn error(&self, title: &str, message: Option<String>) {
        log::error!("{}: {}", title, message.as_deref().unwrap_or("-"));
        self.emit(UsbEvent::error(title, message));
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(LogSink)
    }
}
