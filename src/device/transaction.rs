use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use super::{DeviceError, Result};
use crate::events::Notifier;
use crate::serial::PortIo;

pub const DEVICE_NOT_FOUND: &str = "device not found";
pub const READ_ERROR: &str = "Serial port read error";
pub const COMMUNICATION_ERROR: &str = "Serial port communication error";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
pub const READ_BUFFER_SIZE: usize = 64;

pub type SharedPort = Arc<Mutex<Box<dyn PortIo>>>;

// Process-wide: only one physical connection is supported, so exchanges from every
// manager instance queue on the same lock. Supporting several connections would need a
// per-port lock instead.
static TRANSACTION_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Runs write-then-read exchanges against the open port, one at a time.
#[derive(Clone)]
pub struct TransactionExecutor {
    notifier: Notifier,
    read_buffer_size: usize,
}

impl TransactionExecutor {
    pub fn new(notifier: Notifier, read_buffer_size: usize) -> Self {
        Self {
            notifier,
            read_buffer_size: read_buffer_size.max(1),
        }
    }

    /// Write `data`, then read one response of at most `read_buffer_size` bytes.
    pub async fn execute(&self, port: Option<SharedPort>, data: Vec<u8>, timeout: Duration) -> Result<String> {
        let port = port.ok_or(DeviceError::NotFound)?;
        let _serialized = TRANSACTION_LOCK.lock().await;

        let buffer_size = self.read_buffer_size;
        tokio::task::spawn_blocking(move || {
            let mut port = port.blocking_lock();
            if !port.is_open() {
                return Err(DeviceError::NotFound);
            }
            exchange(&mut **port, &data, timeout, buffer_size)
        })
        .await
        .map_err(|e| DeviceError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    /// Like [`execute`](Self::execute) but always resolves, with an error string when the
    /// exchange failed. Faults are also reported as error events.
    pub async fn write_and_read(&self, port: Option<SharedPort>, data: Vec<u8>, timeout: Duration) -> String {
        match self.execute(port, data, timeout).await {
            Ok(response) => response,
            Err(DeviceError::NotFound) => DEVICE_NOT_FOUND.to_string(),
            Err(DeviceError::EmptyRead) => {
                self.notifier.error(READ_ERROR, None);
                READ_ERROR.to_string()
            }
            Err(e) => {
                self.notifier.error(COMMUNICATION_ERROR, Some(e.to_string()));
                COMMUNICATION_ERROR.to_string()
            }
        }
    }
}

fn exchange(port: &mut dyn PortIo, data: &[u8], timeout: Duration, buffer_size: usize) -> Result<String> {
    port.write(data, timeout)?;

    let mut buffer = vec![0u8; buffer_size];
    let bytes_read = port.read(&mut buffer, timeout)?;
    if bytes_read == 0 {
        return Err(DeviceError::EmptyRead);
    }

    log::debug!("Exchanged {} byte(s) out, {} byte(s) in", data.len(), bytes_read);
    Ok(String::from_utf8_lossy(&buffer[..bytes_read]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::serial::{LineSettings, SerialError};

    struct ScriptedPort {
        response: Vec<u8>,
        fail_write: bool,
        open: bool,
    }

    impl PortIo for ScriptedPort {
        fn set_parameters(&mut self, _settings: &LineSettings) -> crate::serial::Result<()> {
            Ok(())
        }

        fn write(&mut self, data: &[u8], _timeout: Duration) -> crate::serial::Result<usize> {
            if self.fail_write {
                return Err(SerialError::Timeout);
            }
            Ok(data.len())
        }

        fn read(&mut self, buffer: &mut [u8], _timeout: Duration) -> crate::serial::Result<usize> {
            let n = self.response.len().min(buffer.len());
            buffer[..n].copy_from_slice(&self.response[..n]);
            Ok(n)
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn close(&mut self) -> crate::serial::Result<()> {
            self.open = false;
            Ok(())
        }
    }

    fn shared(response: &[u8], fail_write: bool) -> Option<SharedPort> {
        let port: Box<dyn PortIo> = Box::new(ScriptedPort {
            response: response.to_vec(),
            fail_write,
            open: true,
        });
        Some(Arc::new(Mutex::new(port)))
    }

    #[tokio::test]
    async fn response_is_truncated_to_buffer() {
        let (sink, _rx) = events::channel();
        let executor = TransactionExecutor::new(Notifier::new(sink), 4);
        let response = executor.execute(shared(b"pH 6.85", false), vec![0x01], DEFAULT_TIMEOUT).await;
        assert_eq!(response.unwrap(), "pH 6");
    }

    #[tokio::test]
    async fn missing_port_is_not_an_event() {
        let (sink, mut rx) = events::channel();
        let executor = TransactionExecutor::new(Notifier::new(sink), READ_BUFFER_SIZE);
        let response = executor.write_and_read(None, vec![0x01], DEFAULT_TIMEOUT).await;
        assert_eq!(response, DEVICE_NOT_FOUND);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_port_counts_as_missing() {
        let (sink, _rx) = events::channel();
        let executor = TransactionExecutor::new(Notifier::new(sink), READ_BUFFER_SIZE);
        let port = shared(b"x", false).unwrap();
        port.lock().await.close().unwrap();
        let response = executor.write_and_read(Some(port), vec![0x01], DEFAULT_TIMEOUT).await;
        assert_eq!(response, DEVICE_NOT_FOUND);
    }

    #[tokio::test]
    async fn write_fault_resolves_with_error_string() {
        let (sink, mut rx) = events::channel();
        let executor = TransactionExecutor::new(Notifier::new(sink), READ_BUFFER_SIZE);
        let response = executor.write_and_read(shared(b"", true), vec![0x01], DEFAULT_TIMEOUT).await;
        assert_eq!(response, COMMUNICATION_ERROR);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, events::ON_ERROR);
        assert_eq!(event.payload["title"], COMMUNICATION_ERROR);
    }
}
