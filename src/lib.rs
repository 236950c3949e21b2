pub mod device;
pub mod events;
pub mod serial;

pub use device::{
    ConnectionConfig, ConnectionManager, DeviceError, DeviceFilter, ManagerSettings, ServiceState,
    SessionInfo,
};
pub use events::{EventSink, HostEvent, Notifier, UsbEvent};
pub use serial::{DeviceDescriptor, SimulatedUsbHost, SystemUsbHost, UsbHost};
