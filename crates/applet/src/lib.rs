//! usb-applet core
//!
//! Client-side coordinator for USB-device-to-VM assignment. The hotplug
//! service owns the devices and the policy; this crate tracks what it reports,
//! sends attach/detach commands on its behalf and turns its push
//! notifications into prompts for whoever renders the UI.
//!
//! Collaborators interact only with [`AssignmentCoordinator`]:
//!
//! ```no_run
//! use applet::{AssignmentCoordinator, ControlChannel, CoordinatorOptions};
//! use common::Endpoint;
//!
//! # async fn demo() -> Result<(), applet::CoordinatorError> {
//! let coordinator = AssignmentCoordinator::new(
//!     ControlChannel::new(Endpoint::default()),
//!     CoordinatorOptions::default(),
//! );
//! coordinator.connect().await?;
//! let snapshot = coordinator.refresh().await?;
//! for device in snapshot.devices() {
//!     println!("{} -> {}", device.name, device.current_vm);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod network;
pub mod registry;

pub use config::AppletConfig;
pub use coordinator::{
    AssignmentChange, AssignmentCoordinator, CoordinatorEvent, CoordinatorOptions,
    ReassignStrategy, SelectionPrompt,
};
pub use error::{ChannelError, CoordinatorError, ValidationError};
pub use network::{
    ConnectionState, ControlChannel, ControlTransport, NotificationChannel, NotificationEvent,
    NotificationHandle, SelectionRequired,
};
pub use registry::{Assignment, DETACH_SENTINEL, Device, DeviceRegistry, Snapshot};
