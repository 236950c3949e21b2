use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::serial::Result;

/// Events emitted by the port monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A serial port was added
    PortAdded(String),
    /// A serial port was removed
    PortRemoved(String),
}

/// Platform-agnostic trait for monitoring serial port changes
#[async_trait::async_trait]
pub trait PortMonitor: Send + Sync {
    /// Start monitoring for port changes
    async fn start(&mut self) -> Result<()>;

    /// Stop monitoring
    async fn stop(&mut self) -> Result<()>;

    /// Get receiver for port events
    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>>;
}

/// Settling timers for detach notifications, keyed by device handle.
///
/// A detach arms a timer; a matching attach before it fires cancels it, so a device
/// that re-enumerates quickly is never treated as gone.
pub struct DetachDebouncer {
    delay: Duration,
    pending: HashMap<Option<String>, JoinHandle<()>>,
}

impl DetachDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
        }
    }

    /// Run `on_settled` once the delay passes, replacing any timer already armed for `key`.
    pub fn schedule<F>(&mut self, key: Option<String>, on_settled: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_settled.await;
        });

        if let Some(previous) = self.pending.insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancel the timer for `key`. Returns true if one was still pending.
    pub fn cancel(&mut self, key: &Option<String>) -> bool {
        match self.pending.remove(key) {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                was_pending
            }
            None => false,
        }
    }

    /// Forget a timer that has fired.
    pub fn settled(&mut self, key: &Option<String>) {
        self.pending.remove(key);
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.values().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for DetachDebouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

// Platform-specific implementations
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxPortMonitor;

mod polling;
pub use polling::PollingPortMonitor;

/// Create a platform-specific port monitor
pub fn create_port_monitor(poll_interval: Duration) -> Box<dyn PortMonitor> {
    #[cfg(target_os = "linux")]
    {
        let _ = poll_interval;
        Box::new(LinuxPortMonitor::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Box::new(PollingPortMonitor::new(poll_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn settled_timer_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut debouncer = DetachDebouncer::new(Duration::from_millis(20));

        let counter = fired.clone();
        debouncer.schedule(Some("/dev/ttyUSB0".into()), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(debouncer.pending(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test]
    async fn matching_cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut debouncer = DetachDebouncer::new(Duration::from_millis(50));

        let counter = fired.clone();
        debouncer.schedule(Some("/dev/ttyUSB0".into()), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!debouncer.cancel(&Some("/dev/ttyUSB1".into())));
        assert!(debouncer.cancel(&Some("/dev/ttyUSB0".into())));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rescheduling_replaces_the_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut debouncer = DetachDebouncer::new(Duration::from_millis(30));

        for _ in 0..3 {
            let counter = fired.clone();
            debouncer.schedule(None, async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
