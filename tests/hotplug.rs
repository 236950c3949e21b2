mod common;

use std::time::Duration;

use common::{fast_settings, meter, settle, Harness, PORT};
use phmeter_serial_lib::events::{ON_DEVICE_ATTACHED, ON_DEVICE_DETACHED};
use phmeter_serial_lib::{ManagerSettings, ServiceState, SimulatedUsbHost};

#[tokio::test]
async fn test_detach_of_connected_meter_closes_session() {
    let mut h = Harness::connected(4800, 8).await;

    assert!(h.host.detach(PORT));
    assert!(h.wait_event(ON_DEVICE_DETACHED).await.is_some());
    assert!(h.wait_open(false).await, "session survived the detach");
    assert_eq!(h.host.open_ports(), 0);
    assert!(h.manager.is_service_started().await);
}

#[tokio::test]
async fn test_idle_detach_emits_single_event() {
    let mut h = Harness::with_meter();
    h.manager.start_service().await;
    h.drain();

    assert!(h.host.detach(PORT));
    settle(400).await;

    let detached = h.drain().into_iter().filter(|e| e.name == ON_DEVICE_DETACHED).count();
    assert_eq!(detached, 1, "one unplug produced {} onDeviceDetached events", detached);
    assert!(h.manager.selected_device().await.is_none());
    assert_eq!(h.manager.state().await, ServiceState::Idle);
}

#[tokio::test]
async fn test_detach_of_other_device_keeps_session() {
    let host = SimulatedUsbHost::new()
        .with_device(meter("/dev/ttyUSB1"))
        .with_device(meter(PORT));
    let mut h = Harness::new(host, fast_settings());
    h.manager.start_service().await;
    h.manager.connect(4800, 8).await;
    assert!(h.wait_open(true).await);

    let session = h.manager.session_info().await.expect("no session");
    assert_eq!(session.device.device_name, PORT, "first device by handle wins");

    h.host.detach("/dev/ttyUSB1");
    assert!(h.wait_event(ON_DEVICE_DETACHED).await.is_some());
    settle(200).await;
    assert!(h.manager.is_open().await);
    assert_eq!(h.manager.selected_device().await.map(|d| d.device_name), Some(PORT.to_string()));
}

#[tokio::test]
async fn test_quick_reattach_cancels_pending_detach() {
    let settings = ManagerSettings {
        settle_delay_ms: 300,
        ..ManagerSettings::default()
    };
    let mut h = Harness::new(SimulatedUsbHost::new().with_device(meter(PORT)), settings);
    h.manager.start_service().await;
    h.manager.connect(4800, 8).await;
    assert!(h.wait_open(true).await);

    h.host.detach(PORT);
    h.host.attach(meter(PORT));
    assert!(h.wait_event(ON_DEVICE_DETACHED).await.is_some());
    assert!(h.wait_event(ON_DEVICE_ATTACHED).await.is_some());

    settle(500).await;
    assert!(h.manager.is_open().await, "re-attach within the settling delay must keep the session");
    assert_eq!(h.host.open_ports(), 1);
}

#[tokio::test]
async fn test_attach_in_auto_mode_connects() {
    let mut h = Harness::new(SimulatedUsbHost::new(), fast_settings());
    h.manager.set_auto_connect(true).await;
    h.manager.start_service().await;
    settle(50).await;
    assert!(!h.manager.is_open().await);

    h.host.attach(meter(PORT));
    assert!(h.wait_event(ON_DEVICE_ATTACHED).await.is_some());
    assert!(h.wait_open(true).await, "attach did not auto-connect");
    assert_eq!(h.host.permission_requests(), 1);
}

#[tokio::test]
async fn test_attach_without_auto_mode_only_notifies() {
    let mut h = Harness::new(SimulatedUsbHost::new(), fast_settings());
    h.manager.start_service().await;

    h.host.attach(meter(PORT));
    assert!(h.wait_event(ON_DEVICE_ATTACHED).await.is_some());
    settle(100).await;
    assert!(!h.manager.is_open().await);
    assert_eq!(h.host.permission_requests(), 0);
}

#[tokio::test]
async fn test_auto_reconnect_after_unplug() {
    let h = Harness::with_meter();
    h.manager.set_auto_connect(true).await;
    h.manager.start_service().await;
    assert!(h.wait_open(true).await);

    h.host.detach(PORT);
    assert!(h.wait_open(false).await);

    h.host.attach(meter(PORT));
    assert!(h.wait_open(true).await, "meter was not reconnected");
    assert_eq!(h.host.open_ports(), 1);
}

#[tokio::test]
async fn test_detach_during_open_abandons_attempt() {
    let mut h = Harness::with_meter();
    h.host.set_open_delay(Duration::from_millis(300));
    h.manager.start_service().await;
    h.manager.connect(4800, 8).await;
    assert!(h.wait_state(ServiceState::Connecting).await);

    h.host.detach(PORT);
    assert!(h.wait_event(ON_DEVICE_DETACHED).await.is_some());
    assert_eq!(h.manager.state().await, ServiceState::Idle);

    settle(600).await;
    assert!(!h.manager.is_open().await);
    assert_eq!(h.host.open_ports(), 0);
}

#[tokio::test]
async fn test_stop_during_open_discards_late_port() {
    let h = Harness::with_meter();
    h.host.set_open_delay(Duration::from_millis(200));
    h.manager.start_service().await;
    h.manager.connect(4800, 8).await;
    assert!(h.wait_state(ServiceState::Connecting).await);

    h.manager.stop_service().await;
    assert_eq!(h.manager.state().await, ServiceState::Stopped);

    settle(500).await;
    assert!(!h.manager.is_open().await);
    assert_eq!(h.host.open_ports(), 0, "late port was not closed");
}

#[tokio::test]
async fn test_events_after_stop_are_ignored() {
    let mut h = Harness::with_meter();
    h.manager.start_service().await;
    h.manager.stop_service().await;
    h.drain();

    h.host.detach(PORT);
    h.host.attach(meter(PORT));
    settle(100).await;
    assert!(h.drain().is_empty());
}
