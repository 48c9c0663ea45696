//! Protocol message definitions
//!
//! Messages are grouped by channel:
//! - Control channel: one `Command` answered by exactly one `Reply`
//! - Notification channel: unsolicited `PushMessage`s
//!
//! The hotplug service is lenient about which reply fields it fills in, so
//! every reply and device field is optional on the wire.

use serde::{Deserialize, Serialize};

/// Event token the service sends after a successful attach
pub const ATTACHED_EVENT: &str = "usb_attached";

/// Event token the service sends after a successful detach
pub const DETACHED_EVENT: &str = "usb_detached";

/// Push event asking the user to pick a VM for a newly plugged device
pub const SELECT_VM_EVENT: &str = "usb_select_vm";

/// Control-channel request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    /// List every device the service knows about
    #[serde(rename = "usb_list")]
    List,

    /// Pass a device through to a VM
    #[serde(rename = "usb_attach")]
    Attach {
        /// Stable device identifier (e.g. `/dev/bus/usb/001/002`)
        device_node: String,
        /// Target VM name
        vm: String,
    },

    /// Take a device away from whichever VM holds it
    #[serde(rename = "usb_detach")]
    Detach {
        /// Stable device identifier
        device_node: String,
    },
}

impl Command {
    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            Self::List => "usb_list",
            Self::Attach { .. } => "usb_attach",
            Self::Detach { .. } => "usb_detach",
        }
    }

    /// Event token that signals success for this command, if any
    pub fn success_event(&self) -> Option<&'static str> {
        match self {
            Self::List => None,
            Self::Attach { .. } => Some(ATTACHED_EVENT),
            Self::Detach { .. } => Some(DETACHED_EVENT),
        }
    }
}

/// Device entry as reported by the service
///
/// Nothing here is validated; the registry decides what to keep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDevice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_vms: Option<Vec<String>>,
    /// VM currently holding the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
}

impl RawDevice {
    /// Build a device entry with the two identifying fields set
    pub fn new(device_node: impl Into<String>, product_name: impl Into<String>) -> Self {
        Self {
            device_node: Some(device_node.into()),
            product_name: Some(product_name.into()),
            allowed_vms: None,
            vm: None,
        }
    }

    pub fn with_allowed_vms<I, S>(mut self, vms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_vms = Some(vms.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_vm(mut self, vm: impl Into<String>) -> Self {
        self.vm = Some(vm.into());
        self
    }
}

/// Control-channel reply
///
/// Success is signalled either by `result == "ok"` or by an `event` token;
/// see [`crate::classify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present on `usb_list` replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb_devices: Option<Vec<RawDevice>>,
}

impl Reply {
    /// `{"result":"ok"}`
    pub fn ok() -> Self {
        Self {
            result: Some("ok".to_string()),
            ..Self::default()
        }
    }

    /// `{"event":"<token>"}`
    pub fn event(token: impl Into<String>) -> Self {
        Self {
            event: Some(token.into()),
            ..Self::default()
        }
    }

    /// `{"result":"error","error":"<message>"}`
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: Some("error".to_string()),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// `{"result":"ok","usb_devices":[...]}`
    pub fn devices(devices: Vec<RawDevice>) -> Self {
        Self {
            result: Some("ok".to_string()),
            usb_devices: Some(devices),
            ..Self::default()
        }
    }
}

/// Unsolicited notification pushed by the service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb_device: Option<RawDevice>,
    #[serde(default)]
    pub allowed_vms: Vec<String>,
}

impl PushMessage {
    /// Build a `usb_select_vm` notification
    pub fn select_vm<I, S>(device: RawDevice, allowed_vms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event: SELECT_VM_EVENT.to_string(),
            usb_device: Some(device),
            allowed_vms: allowed_vms.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_select_vm(&self) -> bool {
        self.event == SELECT_VM_EVENT
    }
}
