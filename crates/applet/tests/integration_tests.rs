//! End-to-end coordinator tests against a scripted hotplug service

use applet::{
    AssignmentChange, AssignmentCoordinator, ConnectionState, ControlChannel, CoordinatorError,
    CoordinatorEvent, CoordinatorOptions, DETACH_SENTINEL, ReassignStrategy, ValidationError,
};
use common::test_utils::{DEFAULT_TEST_TIMEOUT, MockHotplugService, MockResponse, with_timeout};
use protocol::{Command, RawDevice, Reply};
use std::sync::{Arc, Mutex};

const MOUSE: &str = "/dev/bus/usb/001/002";

async fn coordinator_for(service: &MockHotplugService) -> AssignmentCoordinator {
    coordinator_with(service, CoordinatorOptions::default()).await
}

async fn coordinator_with(
    service: &MockHotplugService,
    options: CoordinatorOptions,
) -> AssignmentCoordinator {
    let coordinator = AssignmentCoordinator::new(ControlChannel::new(service.endpoint()), options);
    coordinator.connect().await.unwrap();
    coordinator
}

fn find_node<'a>(devices: &'a mut [RawDevice], node: &str) -> Option<&'a mut RawDevice> {
    devices
        .iter_mut()
        .find(|d| d.device_node.as_deref() == Some(node))
}

/// Service that tracks where each device is, like the real one
fn stateful_service_responder(
    devices: Vec<RawDevice>,
) -> impl Fn(&Command) -> MockResponse + Send + Sync + 'static {
    let state = Arc::new(Mutex::new(devices));
    move |command| {
        let mut devices = state.lock().unwrap();
        let reply = match command {
            Command::List => Reply::devices(devices.clone()),
            Command::Attach { device_node, vm } => {
                match find_node(&mut devices, device_node) {
                    Some(device) => {
                        device.vm = Some(vm.clone());
                        Reply::event("usb_attached")
                    }
                    None => Reply::error("no such device"),
                }
            }
            Command::Detach { device_node } => {
                match find_node(&mut devices, device_node) {
                    Some(device) => {
                        device.vm = None;
                        Reply::ok()
                    }
                    None => Reply::error("no such device"),
                }
            }
        };
        MockResponse::Reply(reply)
    }
}

#[tokio::test]
async fn test_refresh_single_device_scenario() {
    let service = MockHotplugService::start(|_| {
        MockResponse::Raw(
            r#"{"result":"ok","usb_devices":[{"device_node":"/dev/bus/usb/001/002","product_name":"Logi_Mouse"}]}"#
                .to_string(),
        )
    })
    .await;
    let coordinator = coordinator_for(&service).await;

    let snapshot = coordinator.refresh().await.unwrap();

    assert_eq!(snapshot.len(), 1);
    let device = snapshot.get("Logi Mouse").unwrap();
    assert_eq!(device.device_node, MOUSE);
    assert_eq!(device.allowed_vms, vec![DETACH_SENTINEL]);
    assert_eq!(device.current_vm, DETACH_SENTINEL);
}

#[tokio::test]
async fn test_attach_scenarios() {
    let service = MockHotplugService::start(|command| match command {
        Command::List => MockResponse::Reply(Reply::devices(vec![
            RawDevice::new(MOUSE, "Logi_Mouse").with_allowed_vms(["gui-vm", "chrome-vm"]),
        ])),
        Command::Attach { vm, .. } if vm == "gui-vm" => {
            MockResponse::Raw(r#"{"event":"usb_attached"}"#.to_string())
        }
        _ => MockResponse::Raw(r#"{"result":"error","error":"busy"}"#.to_string()),
    })
    .await;
    let coordinator = coordinator_for(&service).await;
    coordinator.refresh().await.unwrap();

    assert_eq!(
        coordinator.attach(MOUSE, "gui-vm").await.unwrap(),
        AssignmentChange::Applied
    );
    assert_eq!(coordinator.resolve(MOUSE).await.unwrap().current_vm, "gui-vm");

    let err = coordinator.attach(MOUSE, "chrome-vm").await.unwrap_err();
    assert_eq!(err, CoordinatorError::Policy("busy".to_string()));
    assert_eq!(coordinator.resolve(MOUSE).await.unwrap().current_vm, "gui-vm");
}

#[tokio::test]
async fn test_registry_converges_after_refresh() {
    let service = MockHotplugService::start(stateful_service_responder(vec![
        RawDevice::new(MOUSE, "Logi_Mouse").with_allowed_vms(["gui-vm", "chrome-vm"]),
        RawDevice::new("/dev/bus/usb/001/003", "Logi_Mouse").with_allowed_vms(["gui-vm"]),
    ]))
    .await;

    for strategy in [ReassignStrategy::Atomic, ReassignStrategy::DetachFirst] {
        let coordinator = coordinator_with(
            &service,
            CoordinatorOptions {
                reassign: strategy,
                ..CoordinatorOptions::default()
            },
        )
        .await;
        coordinator.refresh().await.unwrap();

        coordinator.attach("Logi Mouse", "gui-vm").await.unwrap();
        coordinator.attach("Logi Mouse", "chrome-vm").await.unwrap();
        coordinator.detach("Logi Mouse (1)").await.unwrap();
        let local = coordinator.snapshot().await;

        let authoritative = coordinator.refresh().await.unwrap();
        assert_eq!(local.devices(), authoritative.devices(), "{strategy}");
        assert_eq!(authoritative.get("Logi Mouse").unwrap().current_vm, "chrome-vm");

        coordinator.detach(MOUSE).await.unwrap();
    }
}

#[tokio::test]
async fn test_noop_attach_sends_nothing() {
    let service = MockHotplugService::start(stateful_service_responder(vec![
        RawDevice::new(MOUSE, "Logi_Mouse")
            .with_allowed_vms(["gui-vm", "chrome-vm"])
            .with_vm("gui-vm"),
    ]))
    .await;
    let coordinator = coordinator_for(&service).await;
    coordinator.refresh().await.unwrap();

    assert_eq!(
        coordinator.attach(MOUSE, "gui-vm").await.unwrap(),
        AssignmentChange::Unchanged
    );
    assert_eq!(service.commands(), vec![Command::List]);
}

#[tokio::test]
async fn test_validation_errors_have_no_side_effects() {
    let service = MockHotplugService::start(stateful_service_responder(vec![
        RawDevice::new(MOUSE, "Logi_Mouse").with_allowed_vms(["gui-vm"]),
    ]))
    .await;
    let coordinator = coordinator_for(&service).await;
    coordinator.refresh().await.unwrap();
    let before = coordinator.snapshot().await;

    let err = coordinator.attach(MOUSE, "admin-vm").await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Validation(ValidationError::VmNotPermitted { .. })
    ));
    assert!(coordinator.attach("Trackball", "gui-vm").await.is_err());

    assert_eq!(service.commands(), vec![Command::List]);
    assert_eq!(coordinator.snapshot().await, before);
}

#[tokio::test]
async fn test_transport_loss_is_reported_and_recoverable() {
    let fail = Arc::new(Mutex::new(false));
    let switch = fail.clone();
    let service = MockHotplugService::start(move |command| {
        if *switch.lock().unwrap() {
            return MockResponse::Hangup;
        }
        match command {
            Command::List => MockResponse::Reply(Reply::devices(vec![
                RawDevice::new(MOUSE, "Logi_Mouse").with_allowed_vms(["gui-vm"]),
            ])),
            _ => MockResponse::Reply(Reply::ok()),
        }
    })
    .await;
    let coordinator = coordinator_for(&service).await;
    coordinator.refresh().await.unwrap();

    *fail.lock().unwrap() = true;
    let err = coordinator.attach(MOUSE, "gui-vm").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Transport(_)));
    assert_eq!(coordinator.control().state().await, ConnectionState::Disconnected);
    assert_eq!(
        coordinator.resolve(MOUSE).await.unwrap().current_vm,
        DETACH_SENTINEL
    );

    // Retry is up to the caller
    *fail.lock().unwrap() = false;
    coordinator.connect().await.unwrap();
    coordinator.attach(MOUSE, "gui-vm").await.unwrap();
    assert_eq!(coordinator.resolve(MOUSE).await.unwrap().current_vm, "gui-vm");
}

#[tokio::test]
async fn test_concurrent_requests_are_serialized() {
    let service = MockHotplugService::start(stateful_service_responder(vec![
        RawDevice::new(MOUSE, "Logi_Mouse").with_allowed_vms(["gui-vm", "chrome-vm"]),
    ]))
    .await;
    let coordinator = Arc::new(coordinator_for(&service).await);
    coordinator.refresh().await.unwrap();

    let background = coordinator.spawn_refresh();
    let attach = coordinator.attach(MOUSE, "gui-vm");
    let (refreshed, attached) = tokio::join!(background, attach);

    // Every request got exactly its own reply
    assert!(refreshed.unwrap().is_ok());
    assert_eq!(attached.unwrap(), AssignmentChange::Applied);
    assert_eq!(service.commands().len(), 3);
}

#[tokio::test]
async fn test_snapshot_events_are_published() {
    let service = MockHotplugService::start(stateful_service_responder(vec![
        RawDevice::new(MOUSE, "Logi_Mouse").with_allowed_vms(["gui-vm"]),
    ]))
    .await;
    let coordinator = coordinator_for(&service).await;
    let mut events = coordinator.subscribe();

    coordinator.refresh().await.unwrap();
    coordinator.attach(MOUSE, "gui-vm").await.unwrap();

    let mut generations = Vec::new();
    for _ in 0..2 {
        match with_timeout(DEFAULT_TEST_TIMEOUT, events.recv()).await.unwrap().unwrap() {
            CoordinatorEvent::SnapshotChanged(snapshot) => generations.push(snapshot.generation()),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(generations[0] < generations[1]);
}
