use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serialport::DataBits;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::permission::PermissionGate;
use super::port_monitor::{DetachDebouncer, PortEvent, PortMonitor};
use super::registry::DeviceRegistry;
use super::transaction::{SharedPort, TransactionExecutor};
use super::{
    ConnectionConfig, DeviceError, ManagerSettings, Result, ServiceState, SessionInfo, UsbAction,
};
use crate::events::{Notifier, UsbEvent};
use crate::serial::{
    data_bits_from, DeviceConnection, DeviceDescriptor, LineSettings, PortIo, SerialDriver,
    UsbHost,
};

const CONNECT_ERROR: &str = "Error connecting to device";
const CONNECTION_ERROR: &str = "Connection error";
const COMMUNICATION_ERROR: &str = "Communication error";

/// Everything the manager knows about the USB side. Guarded by one lock: holding it is
/// what serializes attach, detach, permission results and host commands.
struct Session {
    service_started: bool,
    connected: bool,
    device: Option<DeviceDescriptor>,
    driver: Option<SerialDriver>,
    connection: Option<DeviceConnection>,
    port: Option<SharedPort>,
    line: Option<LineSettings>,
    session_id: Option<Uuid>,
    connected_at: Option<DateTime<Utc>>,
    /// Id of the open attempt in flight. Clearing it invalidates the attempt.
    opening: Option<Uuid>,
    actions: Option<mpsc::UnboundedSender<UsbAction>>,
    monitor: Option<Box<dyn PortMonitor>>,
    tasks: Vec<JoinHandle<()>>,
    detach_timers: DetachDebouncer,
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Session {
    fn new(settle_delay: Duration) -> Self {
        Self {
            service_started: false,
            connected: false,
            device: None,
            driver: None,
            connection: None,
            port: None,
            line: None,
            session_id: None,
            connected_at: None,
            opening: None,
            actions: None,
            monitor: None,
            tasks: Vec::new(),
            detach_timers: DetachDebouncer::new(settle_delay),
        }
    }

    fn clear_connection(&mut self) {
        self.connected = false;
        self.device = None;
        self.driver = None;
        self.connection = None;
        self.port = None;
        self.line = None;
        self.session_id = None;
        self.connected_at = None;
    }

    fn info(&self) -> Option<SessionInfo> {
        if !self.connected {
            return None;
        }
        Some(SessionInfo {
            session_id: self.session_id?,
            device: self.device.clone()?,
            line: self.line?,
            connected_at: self.connected_at?,
        })
    }

    /// Whether a detach for `key` concerns the selected device. Keyless detaches are the
    /// synthetic ones re-broadcast by teardown.
    fn concerns_selected(&self, key: &Option<String>) -> bool {
        match (key, &self.device) {
            (Some(name), Some(device)) => &device.device_name == name,
            _ => false,
        }
    }
}

struct OpenedSession {
    driver: SerialDriver,
    connection: DeviceConnection,
    port: Box<dyn PortIo>,
}

struct Inner {
    host: Arc<dyn UsbHost>,
    registry: DeviceRegistry,
    permissions: PermissionGate,
    executor: TransactionExecutor,
    notifier: Notifier,
    settings: ManagerSettings,
    config: RwLock<ConnectionConfig>,
    session: Mutex<Session>,
}

/// Connection state machine for a single USB-serial instrument.
///
/// Cheap to clone; all clones share one session. Host commands never fail: problems
/// are reported through the [`Notifier`] as `onError` events.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

fn validate_line(baud_rate: i32, data_bits: i32) -> Result<(u32, DataBits)> {
    if baud_rate < 1 {
        return Err(DeviceError::Validation(format!("invalid baud rate {}", baud_rate)));
    }
    let bits = data_bits_from(data_bits)
        .ok_or_else(|| DeviceError::Validation(format!("invalid data bits {}", data_bits)))?;
    Ok((baud_rate as u32, bits))
}

fn open_blocking(
    host: &dyn UsbHost,
    notifier: &Notifier,
    device: &DeviceDescriptor,
    line: &LineSettings,
) -> Result<OpenedSession> {
    let driver = host
        .probe_drivers(device)?
        .into_iter()
        .next()
        .ok_or(DeviceError::NoDriver)?;

    let connection = host
        .open_device(&driver.device)
        .ok_or_else(|| DeviceError::OpenFailed(driver.device.device_name.clone()))?;

    let port_name = driver.ports.first().cloned().ok_or(DeviceError::NoPort)?;
    let mut port = host.open_port(&connection, &port_name)?;

    if let Err(e) = port.set_parameters(line) {
        if port.is_open() {
            if let Err(close_err) = port.close() {
                notifier.error("Error closing serial port", Some(close_err.to_string()));
            }
        }
        return Err(e.into());
    }

    log::info!(
        "Opened {} via {} at {} baud, {:?} data bits",
        port_name,
        driver.name,
        line.baud_rate,
        line.data_bits
    );
    Ok(OpenedSession {
        driver,
        connection,
        port,
    })
}

impl ConnectionManager {
    pub fn new(host: Arc<dyn UsbHost>, notifier: Notifier, settings: ManagerSettings) -> Self {
        let registry = DeviceRegistry::new(host.clone(), settings.excluded_devices.clone());
        let permissions = PermissionGate::new(host.clone());
        let executor = TransactionExecutor::new(notifier.clone(), settings.read_buffer_size);
        let session = Session::new(settings.settle_delay());

        Self {
            inner: Arc::new(Inner {
                host,
                registry,
                permissions,
                executor,
                notifier,
                settings,
                config: RwLock::new(ConnectionConfig::default()),
                session: Mutex::new(session),
            }),
        }
    }

    fn report(&self, title: &str, error: &DeviceError) {
        self.inner.notifier.error(title, Some(error.to_string()));
    }

    pub async fn is_open(&self) -> bool {
        self.inner.session.lock().await.connected
    }

    pub async fn is_service_started(&self) -> bool {
        self.inner.session.lock().await.service_started
    }

    pub async fn state(&self) -> ServiceState {
        let session = self.inner.session.lock().await;
        if !session.service_started {
            ServiceState::Stopped
        } else if session.connected {
            ServiceState::Connected
        } else if session.opening.is_some() {
            ServiceState::Connecting
        } else {
            ServiceState::Idle
        }
    }

    pub async fn session_info(&self) -> Option<SessionInfo> {
        self.inner.session.lock().await.info()
    }

    /// The current candidate device, if any.
    pub async fn selected_device(&self) -> Option<DeviceDescriptor> {
        self.inner.session.lock().await.device.clone()
    }

    pub async fn config(&self) -> ConnectionConfig {
        self.inner.config.read().await.clone()
    }

    pub async fn set_auto_connect(&self, enabled: bool) {
        self.inner.config.write().await.auto_connect = enabled;
    }

    pub async fn set_auto_connect_baud_rate(&self, baud_rate: i32) {
        if baud_rate < 1 {
            self.report(
                "Error changing the auto-connect baud rate",
                &DeviceError::Validation(format!("invalid baud rate {}", baud_rate)),
            );
            return;
        }
        self.inner.config.write().await.auto_connect_baud_rate = baud_rate as u32;
    }

    pub async fn set_auto_connect_data_bits(&self, data_bits: i32) {
        match data_bits_from(data_bits) {
            Some(bits) => self.inner.config.write().await.auto_connect_data_bits = bits,
            None => self.report(
                "Error changing the auto-connect data bits",
                &DeviceError::Validation(format!("invalid data bits {}", data_bits)),
            ),
        }
    }

    /// Reset data bits, stop bits and parity to 8N1.
    pub async fn load_default_connection_settings(&self) {
        self.inner.config.write().await.load_defaults();
    }

    /// Start listening for USB notifications. Does nothing if already started.
    pub async fn start_service(&self) {
        let mut session = self.inner.session.lock().await;
        if session.service_started {
            return;
        }

        if let Err(e) = self.register(&mut session).await {
            self.report("Error starting service", &e);
            return;
        }
        session.service_started = true;

        let device_attached = match self.inner.registry.list_devices() {
            Ok(devices) => !devices.is_empty(),
            Err(e) => {
                self.report("Error finding a device", &e);
                false
            }
        };

        log::info!("USB service started (device attached: {})", device_attached);
        self.inner
            .notifier
            .emit(UsbEvent::ServiceStarted { device_attached });

        self.check_auto_connect(&mut session).await;
    }

    async fn register(&self, session: &mut Session) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<UsbAction>();

        let mut monitor = self.inner.host.port_monitor();
        let port_events = monitor.get_receiver();
        monitor.start().await?;

        if let Some(mut port_events) = port_events {
            let forward = tx.clone();
            session.tasks.push(tokio::spawn(async move {
                while let Some(event) = port_events.recv().await {
                    let action = match event {
                        PortEvent::PortAdded(name) => UsbAction::Attached(Some(name)),
                        PortEvent::PortRemoved(name) => UsbAction::Detached(Some(name)),
                    };
                    if forward.send(action).is_err() {
                        break;
                    }
                }
            }));
        }

        // Weak, so dropping every handle frees the manager even without stop_service.
        let inner = Arc::downgrade(&self.inner);
        session.tasks.push(tokio::spawn(async move {
            while let Some(action) = rx.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                ConnectionManager { inner }.handle_action(action).await;
            }
        }));

        session.actions = Some(tx);
        session.monitor = Some(monitor);
        Ok(())
    }

    /// Stop listening for USB notifications. Refused while a session is open.
    pub async fn stop_service(&self) {
        let mut session = self.inner.session.lock().await;
        if session.connected {
            self.report(
                "Error stopping service",
                &DeviceError::Precondition("close the connection first".to_string()),
            );
            return;
        }
        if !session.service_started {
            return;
        }

        session.detach_timers.cancel_all();
        session.opening = None;
        session.actions = None;
        for task in session.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut monitor) = session.monitor.take() {
            if let Err(e) = monitor.stop().await {
                log::warn!("Port monitor did not stop cleanly: {}", e);
            }
        }

        session.device = None;
        session.service_started = false;

        log::info!("USB service stopped");
        self.inner.notifier.emit(UsbEvent::ServiceStopped);
    }

    /// Ask for permission on the selected device and open a session once granted.
    ///
    /// Returns immediately; the outcome is observable through events and [`is_open`](Self::is_open).
    /// In auto-connect mode the auto-connect profile wins over the arguments.
    pub async fn connect(&self, baud_rate: i32, data_bits: i32) {
        let mut session = self.inner.session.lock().await;
        if let Err(e) = self
            .connect_locked(&mut session, validate_line(baud_rate, data_bits))
            .await
        {
            self.report(CONNECT_ERROR, &e);
        }
    }

    async fn connect_locked(&self, session: &mut Session, requested: Result<(u32, DataBits)>) -> Result<()> {
        if !session.service_started {
            return Err(DeviceError::Precondition("service not started".to_string()));
        }
        if session.connected {
            return Err(DeviceError::Precondition("serial port already connected".to_string()));
        }
        if session.opening.is_some() {
            return Err(DeviceError::Precondition("connection already in progress".to_string()));
        }
        let (baud_rate, data_bits) = requested?;

        {
            let mut config = self.inner.config.write().await;
            if !config.auto_connect {
                config.baud_rate = baud_rate;
                config.data_bits = data_bits;
            }
        }

        if session.device.is_none() {
            self.choose_device(session);
        }
        self.request_permission(session);
        Ok(())
    }

    fn request_permission(&self, session: &Session) {
        let Some(device) = session.device.clone() else {
            log::debug!("No device selected, not requesting permission");
            return;
        };
        let Some(actions) = session.actions.clone() else {
            return;
        };
        self.inner.permissions.request(device, actions);
    }

    /// Close the open session, if any.
    pub async fn disconnect(&self) {
        let mut session = self.inner.session.lock().await;
        if !session.service_started || !session.connected {
            return;
        }
        self.teardown(&mut session).await;
    }

    /// Write `data` and return the instrument's reply as text.
    ///
    /// Never fails: without an open port this resolves to `"device not found"`, and I/O
    /// faults resolve to an error string after an `onError` event.
    pub async fn write_and_read(&self, data: Vec<u8>, timeout: Option<Duration>) -> String {
        let port = self.inner.session.lock().await.port.clone();
        let timeout = timeout.unwrap_or_else(|| self.inner.settings.transaction_timeout());
        let executor = self.inner.executor.clone();

        match tokio::spawn(async move { executor.write_and_read(port, data, timeout).await }).await {
            Ok(response) => response,
            Err(e) => {
                self.inner
                    .notifier
                    .error(COMMUNICATION_ERROR, Some(e.to_string()));
                COMMUNICATION_ERROR.to_string()
            }
        }
    }

    async fn check_auto_connect(&self, session: &mut Session) {
        let (enabled, baud_rate, data_bits) = {
            let config = self.inner.config.read().await;
            (config.auto_connect, config.auto_connect_baud_rate, config.auto_connect_data_bits)
        };
        if !enabled || session.connected || session.opening.is_some() {
            return;
        }

        if self.choose_device(session) {
            if let Err(e) = self.connect_locked(session, Ok((baud_rate, data_bits))).await {
                self.report(CONNECT_ERROR, &e);
            }
        }
    }

    /// Re-run the selection policy. The selection only changes while no session is open.
    fn choose_device(&self, session: &mut Session) -> bool {
        let selection = match self.inner.registry.select() {
            Ok(selection) => selection,
            Err(e) => {
                self.report("Error finding a device", &e);
                return false;
            }
        };

        for device in &selection.rejected {
            self.inner.notifier.error(
                "Invalid device",
                Some(format!(
                    "{:04x}:{:04x} at {} is excluded",
                    device.vendor_id, device.product_id, device.device_name
                )),
            );
        }

        let found = selection.candidate.is_some();
        if !session.connected {
            session.device = selection.candidate;
        }
        found
    }

    async fn handle_action(&self, action: UsbAction) {
        let mut session = self.inner.session.lock().await;
        if !session.service_started {
            log::debug!("Ignoring {:?}: service stopped", action);
            return;
        }

        log::debug!("Handling {:?}", action);
        match action {
            UsbAction::Attached(key) => self.on_attached(&mut session, key).await,
            UsbAction::Detached(key) => self.on_detached(&mut session, key),
            UsbAction::DetachSettled(key) => self.on_detach_settled(&mut session, key).await,
            UsbAction::PermissionResult { granted } => {
                self.on_permission_result(&mut session, granted).await
            }
        }
    }

    async fn on_attached(&self, session: &mut Session, key: Option<String>) {
        self.inner.notifier.emit(UsbEvent::DeviceAttached);

        if session.detach_timers.cancel(&key) {
            log::info!(
                "{} came back within the settling delay",
                key.as_deref().unwrap_or("device")
            );
        }

        self.check_auto_connect(session).await;
    }

    fn on_detached(&self, session: &mut Session, key: Option<String>) {
        self.inner.notifier.emit(UsbEvent::DeviceDetached);

        if session.opening.is_some() && session.concerns_selected(&key) {
            log::warn!("Device detached while a connection was being opened; abandoning it");
            session.opening = None;
        }

        let Some(actions) = session.actions.clone() else {
            return;
        };
        let settled = key.clone();
        session.detach_timers.schedule(key, async move {
            let _ = actions.send(UsbAction::DetachSettled(settled));
        });
    }

    async fn on_detach_settled(&self, session: &mut Session, key: Option<String>) {
        session.detach_timers.settled(&key);

        let candidate = self.choose_device(session);
        if session.connected && !candidate {
            log::info!("No usable device left after detach; closing the session");
            self.teardown(session).await;
        }
    }

    async fn on_permission_result(&self, session: &mut Session, granted: bool) {
        if !granted {
            self.inner.notifier.error("USB permission denied", None);
            return;
        }
        if session.device.is_some() {
            self.start_connection(session).await;
        }
    }

    async fn start_connection(&self, session: &mut Session) {
        let Some(device) = session.device.clone() else {
            return;
        };
        if session.connected || session.opening.is_some() {
            log::debug!("Connection to {} already open or opening", device.device_name);
            return;
        }

        let attempt = Uuid::new_v4();
        session.opening = Some(attempt);
        let line = self.inner.config.read().await.line_settings();

        let manager = self.clone();
        tokio::spawn(async move { manager.open_session(attempt, device, line).await });
    }

    async fn open_session(&self, attempt: Uuid, device: DeviceDescriptor, line: LineSettings) {
        let host = self.inner.host.clone();
        let notifier = self.inner.notifier.clone();
        let target = device.clone();
        let opened = tokio::task::spawn_blocking(move || {
            open_blocking(host.as_ref(), &notifier, &target, &line)
        })
        .await
        .unwrap_or_else(|e| Err(DeviceError::OpenFailed(format!("{}: {}", device.device_name, e))));

        let mut session = self.inner.session.lock().await;
        let current = session.opening == Some(attempt) && session.service_started;
        if session.opening == Some(attempt) {
            session.opening = None;
        }

        match opened {
            Ok(opened) if current => {
                session.connected = true;
                session.device = Some(device.clone());
                session.driver = Some(opened.driver);
                session.connection = Some(opened.connection);
                session.port = Some(Arc::new(Mutex::new(opened.port)));
                session.line = Some(line);
                session.session_id = Some(attempt);
                session.connected_at = Some(Utc::now());
                log::info!("USB serial connection established with {}", device.device_name);
            }
            Ok(mut opened) => {
                log::warn!(
                    "Discarding connection to {}: the attempt was invalidated",
                    device.device_name
                );
                if let Err(e) = opened.port.close() {
                    self.report("Error closing serial port", &DeviceError::from(e));
                }
            }
            Err(e) => {
                let title = match e {
                    DeviceError::SerialError(_) | DeviceError::IoError(_) => "Error opening serial port",
                    _ => CONNECTION_ERROR,
                };
                self.report(title, &e);
            }
        }
    }

    /// Shared by disconnect and detach handling. Without an open session the detach is
    /// re-broadcast so the selection is re-evaluated.
    async fn teardown(&self, session: &mut Session) {
        if session.connected {
            if let Some(port) = session.port.take() {
                let mut port = port.lock().await;
                if let Err(e) = port.close() {
                    self.report("Error closing connection", &DeviceError::from(e));
                }
            }

            let device_name = session
                .device
                .as_ref()
                .map(|d| d.device_name.clone())
                .unwrap_or_default();
            session.clear_connection();
            log::info!("Closed connection to {}", device_name);
        } else if let Some(actions) = &session.actions {
            log::debug!("No open session; re-broadcasting detach");
            let _ = actions.send(UsbAction::Detached(None));
        }
    }
}
