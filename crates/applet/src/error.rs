//! Error types for the applet core
//!
//! Channel failures are split from coordinator failures so the transports stay
//! ignorant of policy; the coordinator widens them with the service's refusals
//! and its own request validation.

use thiserror::Error;

/// Failure of a single control-channel exchange
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Connection refused, reset or closed; the channel is disconnected
    #[error("Transport error: {0}")]
    Transport(String),

    /// The reply could not be decoded; the channel stays usable
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Request rejected before it reached the network
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("VM '{vm}' is not permitted for device {device_node}")]
    VmNotPermitted { device_node: String, vm: String },

    #[error("'{0}' is the detach entry; detach the device instead")]
    DetachSentinel(String),

    #[error("Operation not permitted: {device} has {available} VM choice(s), at least 2 needed")]
    InsufficientChoices { device: String, available: usize },

    #[error("Notification for a device without a device node")]
    MissingDeviceNode,
}

/// Error returned by every coordinator operation
///
/// Cloneable so it can be published to subscribers alongside events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The service declined; message is the service's own
    #[error("{0}")]
    Policy(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<ChannelError> for CoordinatorError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Transport(msg) => Self::Transport(msg),
            ChannelError::Protocol(msg) => Self::Protocol(msg),
        }
    }
}

impl CoordinatorError {
    /// Short title suitable for an error dialog
    pub fn title(&self) -> &'static str {
        match self {
            Self::Transport(_) => "Server Error",
            Self::Protocol(_) => "Server Error",
            Self::Policy(_) => "Failed to attach",
            Self::Validation(_) => "Device Error",
        }
    }
}
