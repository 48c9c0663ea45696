//! Reconciled device state
//!
//! The registry is rebuilt wholesale from every successful `usb_list` and
//! only mutated in place by successful attach/detach. Readers never see it
//! directly: they get an immutable [`Snapshot`].

use protocol::RawDevice;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// `allowed_vms` entry meaning "not attached to any VM"
pub const DETACH_SENTINEL: &str = "eject";

/// Label used in place of a purely numeric product name
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Label for a pushed device that carries no product name at all
pub const UNNAMED_DEVICE: &str = "<unknown device>";

/// Display names are cut to this many characters
pub const DEFAULT_NAME_MAX_LEN: usize = 20;

/// Assignment state of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Unattached,
    Attached(String),
}

/// One reconciled device
///
/// Invariants: `allowed_vms[0]` is [`DETACH_SENTINEL`] and `current_vm` is
/// always a member of `allowed_vms` (the sentinel when detached).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Display key, unique within a snapshot
    pub name: String,
    pub device_node: String,
    /// Product name exactly as the service reported it
    pub product_name: String,
    pub allowed_vms: Vec<String>,
    pub current_vm: String,
}

impl Device {
    /// Build a device from a raw entry, or `None` if it lacks identity
    ///
    /// `name` is the normalized display name before disambiguation.
    pub fn from_raw(raw: &RawDevice, name_max_len: usize) -> Option<Self> {
        let device_node = raw.device_node.clone()?;
        let product_name = raw.product_name.clone()?;
        let (allowed_vms, current_vm) =
            normalize_vms(raw.allowed_vms.as_deref().unwrap_or_default(), raw.vm.as_deref());

        Some(Self {
            name: display_name(&product_name, name_max_len),
            device_node,
            product_name,
            allowed_vms,
            current_vm,
        })
    }

    pub fn is_attached(&self) -> bool {
        self.current_vm != DETACH_SENTINEL
    }

    /// VM holding the device, if any
    pub fn attached_vm(&self) -> Option<&str> {
        self.is_attached().then_some(self.current_vm.as_str())
    }

    pub fn assignment(&self) -> Assignment {
        match self.attached_vm() {
            Some(vm) => Assignment::Attached(vm.to_string()),
            None => Assignment::Unattached,
        }
    }

    /// Selectable VMs, sentinel excluded
    pub fn vm_choices(&self) -> impl Iterator<Item = &str> {
        self.allowed_vms
            .iter()
            .map(String::as_str)
            .filter(|vm| *vm != DETACH_SENTINEL)
    }

    /// Whether a user has a real choice to make for this device
    pub fn has_choice(&self) -> bool {
        self.vm_choices().nth(1).is_some()
    }

    pub fn allows(&self, vm: &str) -> bool {
        self.allowed_vms.iter().any(|allowed| allowed == vm)
    }
}

/// Normalize a product name for display
///
/// Underscores become spaces, purely numeric names become
/// [`UNKNOWN_DEVICE`], and the result is cut to `max_len` characters.
pub fn display_name(product_name: &str, max_len: usize) -> String {
    let trimmed = product_name.trim();
    let invalid = trimmed.is_empty() || trimmed.chars().all(|c| c.is_ascii_digit());
    let name = if invalid {
        UNKNOWN_DEVICE.to_string()
    } else {
        trimmed.replace('_', " ")
    };

    let truncated: String = name.chars().take(max_len.max(1)).collect();
    truncated.trim_end().to_string()
}

/// Put the sentinel first and make sure the current VM is listed
///
/// Returns `(allowed_vms, current_vm)`.
pub fn normalize_vms(raw_allowed: &[String], raw_current: Option<&str>) -> (Vec<String>, String) {
    let mut allowed = Vec::with_capacity(raw_allowed.len() + 1);
    allowed.push(DETACH_SENTINEL.to_string());
    for vm in raw_allowed {
        if vm.is_empty() || allowed.contains(vm) {
            continue;
        }
        allowed.push(vm.clone());
    }

    let current = match raw_current {
        Some(vm) if !vm.is_empty() => vm.to_string(),
        _ => DETACH_SENTINEL.to_string(),
    };
    if !allowed.contains(&current) {
        allowed.push(current.clone());
    }

    (allowed, current)
}

/// Immutable view of the registry handed to collaborators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    generation: u64,
    devices: Vec<Device>,
}

impl Snapshot {
    /// Bumped on every rebuild or in-place change
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Devices in the order the service listed them
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Look up by display key
    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn by_node(&self, device_node: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.device_node == device_node)
    }

    /// Devices that can be moved between at least two VMs
    pub fn multi_vm_only(&self) -> Vec<&Device> {
        self.devices.iter().filter(|d| d.has_choice()).collect()
    }
}

/// In-memory device state owned by the coordinator
#[derive(Debug)]
pub struct DeviceRegistry {
    name_max_len: usize,
    generation: u64,
    devices: Vec<Device>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_MAX_LEN)
    }
}

impl DeviceRegistry {
    pub fn new(name_max_len: usize) -> Self {
        Self {
            name_max_len: name_max_len.max(1),
            generation: 0,
            devices: Vec::new(),
        }
    }

    /// Replace all state with a fresh device list
    pub fn rebuild(&mut self, raw_devices: &[RawDevice]) {
        let mut seen_names: HashMap<String, usize> = HashMap::new();
        let mut used: HashSet<String> = HashSet::new();
        let mut devices = Vec::with_capacity(raw_devices.len());

        for raw in raw_devices {
            let Some(mut device) = Device::from_raw(raw, self.name_max_len) else {
                debug!("Discarding incomplete device entry: {:?}", raw);
                continue;
            };

            let count = seen_names.entry(device.name.clone()).or_insert(0);
            let mut key = if *count == 0 {
                device.name.clone()
            } else {
                format!("{} ({})", device.name, count)
            };
            // A generated key may already be taken by a real name
            while used.contains(&key) {
                *count += 1;
                key = format!("{} ({})", device.name, count);
            }
            *count += 1;

            used.insert(key.clone());
            device.name = key;
            devices.push(device);
        }

        self.devices = devices;
        self.generation += 1;
    }

    /// Record a confirmed assignment change
    ///
    /// Returns `false` if the device is no longer known, which happens when a
    /// refresh raced the command; the next refresh reconciles.
    pub fn set_current_vm(&mut self, device_node: &str, vm: &str) -> bool {
        let Some(device) = self
            .devices
            .iter_mut()
            .find(|d| d.device_node == device_node)
        else {
            return false;
        };

        if !device.allows(vm) {
            device.allowed_vms.push(vm.to_string());
        }
        device.current_vm = vm.to_string();
        self.generation += 1;
        true
    }

    pub fn by_node(&self, device_node: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.device_node == device_node)
    }

    /// Look up by device node first, then by display key
    pub fn find(&self, name_or_node: &str) -> Option<&Device> {
        self.by_node(name_or_node)
            .or_else(|| self.devices.iter().find(|d| d.name == name_or_node))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            generation: self.generation,
            devices: self.devices.clone(),
        })
    }
}
