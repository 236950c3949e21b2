pub mod manager;
pub mod models;
pub mod permission;
pub mod port_monitor;
pub mod registry;
pub mod transaction;

pub use manager::ConnectionManager;
pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found")]
    NotFound,

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    Validation(String),

    #[error("USB permission denied for {0}")]
    PermissionDenied(String),

    #[error("No USB serial driver available")]
    NoDriver,

    #[error("Failed to open USB serial connection to {0}")]
    OpenFailed(String),

    #[error("No serial port available")]
    NoPort,

    #[error("No bytes read from serial port")]
    EmptyRead,

    #[error("Event delivery failed: {0}")]
    NotificationDelivery(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
