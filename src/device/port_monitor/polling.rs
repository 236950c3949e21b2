use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPortType;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{PortEvent, PortMonitor};
use crate::serial::{Result, SerialError};

type PortLister = Arc<dyn Fn() -> Result<Vec<String>> + Send + Sync>;

fn usb_port_names() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .filter(|p| matches!(p.port_type, SerialPortType::UsbPort(_)))
        .map(|p| p.port_name)
        .collect())
}

/// Detects attach/detach by diffing the USB port list on an interval.
pub struct PollingPortMonitor {
    interval: Duration,
    lister: PortLister,
    tx: Option<mpsc::Sender<PortEvent>>,
    rx: Option<mpsc::Receiver<PortEvent>>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollingPortMonitor {
    pub fn new(interval: Duration) -> Self {
        Self::with_lister(interval, usb_port_names)
    }

    pub fn with_lister<F>(interval: Duration, lister: F) -> Self
    where
        F: Fn() -> Result<Vec<String>> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(100);
        Self {
            interval,
            lister: Arc::new(lister),
            tx: Some(tx),
            rx: Some(rx),
            stop_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl PortMonitor for PollingPortMonitor {
    async fn start(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SerialError::MonitorError("Already started".to_string()))?;
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        let lister = self.lister.clone();
        let mut known: BTreeSet<String> = lister()?.into_iter().collect();
        let mut interval = tokio::time::interval(self.interval);

        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        log::info!("Polling port monitor stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        let current: BTreeSet<String> = match lister() {
                            Ok(ports) => ports.into_iter().collect(),
                            Err(e) => {
                                log::warn!("Port enumeration failed: {}", e);
                                continue;
                            }
                        };

                        let removed = known.difference(&current).cloned().map(PortEvent::PortRemoved);
                        let added = current.difference(&known).cloned().map(PortEvent::PortAdded);
                        for event in removed.chain(added).collect::<Vec<_>>() {
                            if let Err(e) = tx.send(event).await {
                                log::error!("Failed to send port event: {}", e);
                                return;
                            }
                        }
                        known = current;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| SerialError::MonitorError(e.to_string()))?;
        }

        Ok(())
    }

    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.rx.take()
    }
}
