//! Network subsystem
//!
//! Two independent connections to the hotplug service: a request/reply
//! control channel and a long-lived push subscription.

pub mod control;
pub mod notification;

// Re-export public types
pub use control::{ControlChannel, ControlTransport};
pub use notification::{
    DEFAULT_RECONNECT_DELAY, NotificationChannel, NotificationEvent, NotificationHandle,
    SelectionRequired,
};

/// Connection state of a channel
///
/// Channels transition this internally; callers only observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}
