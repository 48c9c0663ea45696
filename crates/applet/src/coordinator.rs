//! Assignment coordinator
//!
//! The single API surface for collaborators. Owns the control transport and
//! the device registry, validates every request before it reaches the
//! network, and publishes immutable snapshots and selection prompts on a
//! broadcast bus that collaborators consume on their own tasks.

use protocol::{Command, Outcome, classify};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ChannelError, CoordinatorError, ValidationError};
use crate::network::{
    ControlChannel, ControlTransport, NotificationChannel, NotificationHandle, SelectionRequired,
};
use crate::registry::{
    DEFAULT_NAME_MAX_LEN, DETACH_SENTINEL, Device, DeviceRegistry, Snapshot, UNNAMED_DEVICE,
    display_name, normalize_vms,
};

/// Capacity of the event bus; slow subscribers see `Lagged`
const EVENT_CAPACITY: usize = 64;

/// How a device is moved from one VM to another
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassignStrategy {
    /// One attach command; the service moves the device
    #[default]
    Atomic,
    /// Explicit detach, then attach
    DetachFirst,
}

impl std::fmt::Display for ReassignStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReassignStrategy::Atomic => write!(f, "atomic"),
            ReassignStrategy::DetachFirst => write!(f, "detach_first"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub name_max_len: usize,
    pub reassign: ReassignStrategy,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            name_max_len: DEFAULT_NAME_MAX_LEN,
            reassign: ReassignStrategy::default(),
        }
    }
}

/// Actionable request to choose a VM for a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionPrompt {
    /// Normalized pushed device; not looked up in the registry
    pub device: Device,
}

impl SelectionPrompt {
    /// VMs to offer, sentinel excluded
    pub fn choices(&self) -> Vec<&str> {
        self.device.vm_choices().collect()
    }
}

/// Events published to collaborators
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    SnapshotChanged(Arc<Snapshot>),
    SelectionRequired(SelectionPrompt),
    /// A pushed selection did not pass validation
    SelectionRejected {
        device: String,
        error: CoordinatorError,
    },
}

/// Whether an attach/detach touched the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentChange {
    Applied,
    /// Already in the requested state; nothing was sent
    Unchanged,
}

/// Turn a pushed selection event into a prompt
///
/// Names are normalized the way a refresh does. Only the pushed VMs are
/// offered, and at least two of them are required.
pub fn selection_prompt(
    event: SelectionRequired,
    name_max_len: usize,
) -> Result<SelectionPrompt, ValidationError> {
    let SelectionRequired {
        device: raw,
        allowed_vms,
    } = event;

    let device_node = raw.device_node.ok_or(ValidationError::MissingDeviceNode)?;
    let product_name = raw.product_name.unwrap_or_else(|| UNNAMED_DEVICE.to_string());

    // Older services only fill the nested list
    let pushed_vms = if allowed_vms.is_empty() {
        raw.allowed_vms.unwrap_or_default()
    } else {
        allowed_vms
    };
    // Only VMs the service pushed are offered; an unlisted current VM is not
    let (allowed_vms, _) = normalize_vms(&pushed_vms, None);
    let current_vm = raw
        .vm
        .filter(|vm| allowed_vms.contains(vm))
        .unwrap_or_else(|| DETACH_SENTINEL.to_string());

    let device = Device {
        name: display_name(&product_name, name_max_len),
        device_node,
        product_name,
        allowed_vms,
        current_vm,
    };

    let available = device.vm_choices().count();
    if available < 2 {
        return Err(ValidationError::InsufficientChoices {
            device: device.name,
            available,
        });
    }

    Ok(SelectionPrompt { device })
}

/// Coordinates device assignment against the hotplug service
pub struct AssignmentCoordinator<T: ControlTransport = ControlChannel> {
    control: T,
    registry: RwLock<DeviceRegistry>,
    events: broadcast::Sender<CoordinatorEvent>,
    options: CoordinatorOptions,
}

impl AssignmentCoordinator<ControlChannel> {
    /// Connect the control channel; no-op when already connected
    pub async fn connect(&self) -> Result<(), CoordinatorError> {
        self.control.connect().await.map_err(Into::into)
    }
}

impl<T: ControlTransport> AssignmentCoordinator<T> {
    pub fn new(control: T, options: CoordinatorOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            control,
            registry: RwLock::new(DeviceRegistry::new(options.name_max_len)),
            events,
            options,
        }
    }

    pub fn control(&self) -> &T {
        &self.control
    }

    pub fn options(&self) -> CoordinatorOptions {
        self.options
    }

    /// Subscribe to snapshot and selection events
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Current registry contents
    pub async fn snapshot(&self) -> Arc<Snapshot> {
        self.registry.read().await.snapshot()
    }

    /// Replace the registry with the service's device list
    ///
    /// On any failure the registry is left exactly as it was.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, CoordinatorError> {
        let reply = self.control.request(Command::List).await?;

        match classify(&reply, None) {
            Outcome::Success => {}
            Outcome::Declined(message) => return Err(CoordinatorError::Policy(message)),
            Outcome::Malformed(reason) => return Err(CoordinatorError::Protocol(reason)),
        }
        let raw_devices = reply.usb_devices.ok_or_else(|| {
            CoordinatorError::Protocol("list reply without usb_devices".to_string())
        })?;

        let snapshot = {
            let mut registry = self.registry.write().await;
            registry.rebuild(&raw_devices);
            registry.snapshot()
        };
        info!(
            "Device list refreshed: {} of {} entries usable",
            snapshot.len(),
            raw_devices.len()
        );

        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    /// Run [`refresh`](Self::refresh) on a background task
    ///
    /// Failures are logged; the result is also available from the handle.
    pub fn spawn_refresh(
        self: &Arc<Self>,
    ) -> JoinHandle<Result<Arc<Snapshot>, CoordinatorError>> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let result = coordinator.refresh().await;
            if let Err(e) = &result {
                warn!("Background refresh failed: {}", e);
            }
            result
        })
    }

    /// Look up a device by device node or display key
    pub async fn resolve(&self, name_or_node: &str) -> Result<Device, CoordinatorError> {
        self.registry
            .read()
            .await
            .find(name_or_node)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownDevice(name_or_node.to_string()).into())
    }

    /// Attach a device to `vm`
    pub async fn attach(&self, device: &str, vm: &str) -> Result<AssignmentChange, CoordinatorError> {
        let device = self.resolve(device).await?;

        if vm == DETACH_SENTINEL {
            return Err(ValidationError::DetachSentinel(vm.to_string()).into());
        }
        if !device.allows(vm) {
            return Err(ValidationError::VmNotPermitted {
                device_node: device.device_node,
                vm: vm.to_string(),
            }
            .into());
        }
        if device.current_vm == vm {
            debug!("{} already attached to {}", device.device_node, vm);
            return Ok(AssignmentChange::Unchanged);
        }

        if self.options.reassign == ReassignStrategy::DetachFirst
            && let Some(previous) = device.attached_vm()
        {
            info!("Detaching {} from {} before reassignment", device.device_node, previous);
            self.execute(Command::Detach {
                device_node: device.device_node.clone(),
            })
            .await?;
            self.commit(&device.device_node, DETACH_SENTINEL).await;
        }

        self.execute(Command::Attach {
            device_node: device.device_node.clone(),
            vm: vm.to_string(),
        })
        .await?;
        info!("Attached {} to {}", device.device_node, vm);
        self.commit(&device.device_node, vm).await;

        Ok(AssignmentChange::Applied)
    }

    /// Detach a device from whichever VM holds it
    pub async fn detach(&self, device: &str) -> Result<AssignmentChange, CoordinatorError> {
        let device = self.resolve(device).await?;

        let Some(vm) = device.attached_vm() else {
            debug!("{} is not attached", device.device_node);
            return Ok(AssignmentChange::Unchanged);
        };

        self.execute(Command::Detach {
            device_node: device.device_node.clone(),
        })
        .await?;
        info!("Detached {} from {}", device.device_node, vm);
        self.commit(&device.device_node, DETACH_SENTINEL).await;

        Ok(AssignmentChange::Applied)
    }

    /// Apply a menu choice: the sentinel detaches, anything else attaches
    pub async fn select(&self, device: &str, choice: &str) -> Result<AssignmentChange, CoordinatorError> {
        if choice == DETACH_SENTINEL {
            self.detach(device).await
        } else {
            self.attach(device, choice).await
        }
    }

    /// Validate a pushed selection event and publish the outcome
    pub fn handle_selection(&self, event: SelectionRequired) -> Result<SelectionPrompt, CoordinatorError> {
        publish_selection(&self.events, event, self.options.name_max_len)
    }

    /// Start the notification subscriber feeding this coordinator's bus
    ///
    /// The registry is not touched; collaborators decide whether a prompt
    /// warrants a refresh.
    pub fn start_notifications(&self, channel: NotificationChannel) -> NotificationHandle {
        let events = self.events.clone();
        let name_max_len = self.options.name_max_len;
        info!("Starting notifications from {}", channel.endpoint());
        channel.spawn(move |event| {
            let _ = publish_selection(&events, event, name_max_len);
        })
    }

    /// Send one command and map the reply onto the error taxonomy
    async fn execute(&self, command: Command) -> Result<(), CoordinatorError> {
        let expected = command.success_event();
        let name = command.name();
        let reply = self
            .control
            .request(command)
            .await
            .inspect_err(|e: &ChannelError| error!("{} failed: {}", name, e))?;

        match classify(&reply, expected) {
            Outcome::Success => Ok(()),
            Outcome::Declined(message) => {
                warn!("{} declined: {}", name, message);
                Err(CoordinatorError::Policy(message))
            }
            Outcome::Malformed(reason) => Err(CoordinatorError::Protocol(reason)),
        }
    }

    async fn commit(&self, device_node: &str, vm: &str) {
        let snapshot = {
            let mut registry = self.registry.write().await;
            if !registry.set_current_vm(device_node, vm) {
                debug!("{} vanished during command; next refresh reconciles", device_node);
                return;
            }
            registry.snapshot()
        };
        self.publish(snapshot);
    }

    fn publish(&self, snapshot: Arc<Snapshot>) {
        let _ = self.events.send(CoordinatorEvent::SnapshotChanged(snapshot));
    }
}

fn publish_selection(
    events: &broadcast::Sender<CoordinatorEvent>,
    event: SelectionRequired,
    name_max_len: usize,
) -> Result<SelectionPrompt, CoordinatorError> {
    let label = event
        .device
        .product_name
        .clone()
        .or_else(|| event.device.device_node.clone())
        .unwrap_or_else(|| UNNAMED_DEVICE.to_string());

    match selection_prompt(event, name_max_len) {
        Ok(prompt) => {
            info!("Selection required for {}", prompt.device.name);
            let _ = events.send(CoordinatorEvent::SelectionRequired(prompt.clone()));
            Ok(prompt)
        }
        Err(e) => {
            warn!("Selection for {} rejected: {}", label, e);
            let error = CoordinatorError::from(e);
            let _ = events.send(CoordinatorEvent::SelectionRejected {
                device: label,
                error: error.clone(),
            });
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{RawDevice, Reply};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport answering from a queue and recording what was sent
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<Reply, ChannelError>>>,
        sent: Mutex<Vec<Command>>,
    }

    impl ScriptedTransport {
        fn with(replies: impl IntoIterator<Item = Result<Reply, ChannelError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<Command> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl ControlTransport for ScriptedTransport {
        async fn request(&self, command: Command) -> Result<Reply, ChannelError> {
            self.sent.lock().unwrap().push(command);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ChannelError::Transport("script exhausted".to_string())))
        }
    }

    fn mouse() -> RawDevice {
        RawDevice::new("/dev/bus/usb/001/002", "Logi_Mouse").with_allowed_vms(["gui-vm", "chrome-vm"])
    }

    async fn coordinator_with(
        devices: Vec<RawDevice>,
        then: impl IntoIterator<Item = Result<Reply, ChannelError>>,
        options: CoordinatorOptions,
    ) -> AssignmentCoordinator<ScriptedTransport> {
        let script = std::iter::once(Ok(Reply::devices(devices))).chain(then);
        let coordinator = AssignmentCoordinator::new(ScriptedTransport::with(script), options);
        coordinator.refresh().await.unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_registry() {
        let coordinator = coordinator_with(
            vec![mouse()],
            [
                Err(ChannelError::Transport("reset".to_string())),
                Ok(Reply::error("busy")),
                Ok(Reply::ok()),
            ],
            CoordinatorOptions::default(),
        )
        .await;
        let before = coordinator.snapshot().await;

        assert!(matches!(coordinator.refresh().await, Err(CoordinatorError::Transport(_))));
        assert_eq!(
            coordinator.refresh().await.unwrap_err(),
            CoordinatorError::Policy("busy".to_string())
        );
        // ok without a device list is not an empty list
        assert!(matches!(coordinator.refresh().await, Err(CoordinatorError::Protocol(_))));

        assert_eq!(coordinator.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_attach_accepts_both_success_shapes() {
        let coordinator = coordinator_with(
            vec![mouse()],
            [Ok(Reply::event("usb_attached")), Ok(Reply::ok())],
            CoordinatorOptions::default(),
        )
        .await;

        let change = coordinator.attach("/dev/bus/usb/001/002", "gui-vm").await.unwrap();
        assert_eq!(change, AssignmentChange::Applied);
        assert_eq!(coordinator.resolve("Logi Mouse").await.unwrap().current_vm, "gui-vm");

        coordinator.attach("Logi Mouse", "chrome-vm").await.unwrap();
        assert_eq!(
            coordinator.resolve("/dev/bus/usb/001/002").await.unwrap().current_vm,
            "chrome-vm"
        );
    }

    #[tokio::test]
    async fn test_attach_to_current_vm_is_noop() {
        let coordinator = coordinator_with(
            vec![mouse().with_vm("gui-vm")],
            [],
            CoordinatorOptions::default(),
        )
        .await;
        let before = coordinator.snapshot().await;

        let change = coordinator.attach("Logi Mouse", "gui-vm").await.unwrap();
        assert_eq!(change, AssignmentChange::Unchanged);
        assert_eq!(coordinator.control().sent(), vec![Command::List]);
        assert_eq!(coordinator.snapshot().await.generation(), before.generation());
    }

    #[tokio::test]
    async fn test_validation_happens_before_network() {
        let coordinator =
            coordinator_with(vec![mouse()], [], CoordinatorOptions::default()).await;

        assert!(matches!(
            coordinator.attach("/dev/bus/usb/009/009", "gui-vm").await,
            Err(CoordinatorError::Validation(ValidationError::UnknownDevice(_)))
        ));
        assert!(matches!(
            coordinator.attach("Logi Mouse", "admin-vm").await,
            Err(CoordinatorError::Validation(ValidationError::VmNotPermitted { .. }))
        ));
        assert!(matches!(
            coordinator.attach("Logi Mouse", DETACH_SENTINEL).await,
            Err(CoordinatorError::Validation(ValidationError::DetachSentinel(_)))
        ));
        assert_eq!(coordinator.control().sent(), vec![Command::List]);
    }

    #[tokio::test]
    async fn test_policy_error_leaves_state() {
        let coordinator = coordinator_with(
            vec![mouse()],
            [Ok(Reply::error("busy")), Ok(Reply { result: Some("error".to_string()), ..Reply::default() })],
            CoordinatorOptions::default(),
        )
        .await;

        let err = coordinator.attach("Logi Mouse", "gui-vm").await.unwrap_err();
        assert_eq!(err, CoordinatorError::Policy("busy".to_string()));
        assert_eq!(err.to_string(), "busy");

        let err = coordinator.attach("Logi Mouse", "gui-vm").await.unwrap_err();
        assert_eq!(err, CoordinatorError::Policy(protocol::UNKNOWN_ERROR.to_string()));

        assert_eq!(coordinator.resolve("Logi Mouse").await.unwrap().current_vm, DETACH_SENTINEL);
    }

    #[tokio::test]
    async fn test_detach() {
        let coordinator = coordinator_with(
            vec![
                mouse().with_vm("gui-vm"),
                RawDevice::new("/dev/bus/usb/001/003", "Keyboard").with_allowed_vms(["gui-vm"]),
            ],
            [Ok(Reply::event("usb_detached"))],
            CoordinatorOptions::default(),
        )
        .await;

        assert_eq!(coordinator.detach("Logi Mouse").await.unwrap(), AssignmentChange::Applied);
        assert_eq!(coordinator.resolve("Logi Mouse").await.unwrap().current_vm, DETACH_SENTINEL);

        // Already detached: nothing sent
        assert_eq!(coordinator.detach("Keyboard").await.unwrap(), AssignmentChange::Unchanged);
        assert_eq!(coordinator.control().sent().len(), 2);
    }

    #[tokio::test]
    async fn test_select_routes_sentinel_to_detach() {
        let coordinator = coordinator_with(
            vec![mouse().with_vm("gui-vm")],
            [Ok(Reply::ok())],
            CoordinatorOptions::default(),
        )
        .await;

        coordinator.select("Logi Mouse", DETACH_SENTINEL).await.unwrap();
        assert_eq!(
            coordinator.control().sent()[1],
            Command::Detach {
                device_node: "/dev/bus/usb/001/002".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_detach_first_reassignment() {
        let options = CoordinatorOptions {
            reassign: ReassignStrategy::DetachFirst,
            ..CoordinatorOptions::default()
        };
        let coordinator = coordinator_with(
            vec![mouse().with_vm("gui-vm")],
            [Ok(Reply::event("usb_detached")), Ok(Reply::error("chrome-vm is stopped"))],
            options,
        )
        .await;

        let err = coordinator.attach("Logi Mouse", "chrome-vm").await.unwrap_err();
        assert_eq!(err, CoordinatorError::Policy("chrome-vm is stopped".to_string()));

        // The detach went through, the attach did not
        assert_eq!(coordinator.resolve("Logi Mouse").await.unwrap().current_vm, DETACH_SENTINEL);
        let sent = coordinator.control().sent();
        assert!(matches!(sent[1], Command::Detach { .. }));
        assert!(matches!(sent[2], Command::Attach { .. }));
    }

    #[tokio::test]
    async fn test_successful_commands_publish_snapshots() {
        let coordinator = coordinator_with(
            vec![mouse()],
            [Ok(Reply::event("usb_attached"))],
            CoordinatorOptions::default(),
        )
        .await;
        let mut events = coordinator.subscribe();

        coordinator.attach("Logi Mouse", "gui-vm").await.unwrap();

        match events.try_recv().unwrap() {
            CoordinatorEvent::SnapshotChanged(snapshot) => {
                assert_eq!(snapshot.get("Logi Mouse").unwrap().current_vm, "gui-vm");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_selection_prompt_normalizes() {
        let event = SelectionRequired {
            device: RawDevice {
                device_node: Some("/dev/bus/usb/002/007".to_string()),
                ..RawDevice::default()
            },
            allowed_vms: vec!["gui-vm".to_string(), "chrome-vm".to_string()],
        };

        let prompt = selection_prompt(event, DEFAULT_NAME_MAX_LEN).unwrap();
        assert_eq!(prompt.device.name, UNNAMED_DEVICE);
        assert_eq!(prompt.device.allowed_vms, vec!["eject", "gui-vm", "chrome-vm"]);
        assert_eq!(prompt.choices(), vec!["gui-vm", "chrome-vm"]);
    }

    #[test]
    fn test_selection_gate() {
        let event = SelectionRequired {
            device: RawDevice::new("/dev/bus/usb/002/008", "Web_Cam"),
            allowed_vms: vec!["eject".to_string(), "gui-vm".to_string()],
        };
        assert_eq!(
            selection_prompt(event, DEFAULT_NAME_MAX_LEN).unwrap_err(),
            ValidationError::InsufficientChoices {
                device: "Web Cam".to_string(),
                available: 1
            }
        );

        let event = SelectionRequired {
            device: RawDevice::default(),
            allowed_vms: vec!["gui-vm".to_string(), "chrome-vm".to_string()],
        };
        assert_eq!(
            selection_prompt(event, DEFAULT_NAME_MAX_LEN).unwrap_err(),
            ValidationError::MissingDeviceNode
        );
    }

    #[test]
    fn test_unlisted_current_vm_does_not_count_as_choice() {
        let coordinator =
            AssignmentCoordinator::new(ScriptedTransport::default(), CoordinatorOptions::default());
        let mut events = coordinator.subscribe();

        let err = coordinator
            .handle_selection(SelectionRequired {
                device: RawDevice::new("/dev/bus/usb/002/010", "Cam").with_vm("admin-vm"),
                allowed_vms: vec!["gui-vm".to_string()],
            })
            .unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::Validation(ValidationError::InsufficientChoices {
                device: "Cam".to_string(),
                available: 1
            })
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            CoordinatorEvent::SelectionRejected { .. }
        ));

        let prompt = coordinator
            .handle_selection(SelectionRequired {
                device: RawDevice::new("/dev/bus/usb/002/011", "Cam").with_vm("admin-vm"),
                allowed_vms: vec!["gui-vm".to_string(), "chrome-vm".to_string()],
            })
            .unwrap();
        assert_eq!(prompt.choices(), vec!["gui-vm", "chrome-vm"]);
        assert_eq!(prompt.device.current_vm, DETACH_SENTINEL);
    }

    #[test]
    fn test_handle_selection_publishes_rejection() {
        let coordinator =
            AssignmentCoordinator::new(ScriptedTransport::default(), CoordinatorOptions::default());
        let mut events = coordinator.subscribe();

        let err = coordinator
            .handle_selection(SelectionRequired {
                device: RawDevice::new("/dev/bus/usb/002/009", "Headset"),
                allowed_vms: vec!["gui-vm".to_string()],
            })
            .unwrap_err();
        assert!(err.to_string().starts_with("Operation not permitted"));

        match events.try_recv().unwrap() {
            CoordinatorEvent::SelectionRejected { device, .. } => assert_eq!(device, "Headset"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
