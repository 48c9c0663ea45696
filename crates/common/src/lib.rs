//! Common utilities for usb-applet
//!
//! This crate provides shared functionality between the protocol layer and the
//! applet, including transport endpoints, error handling, logging setup and
//! test doubles for the hotplug service.

pub mod endpoint;
pub mod error;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use endpoint::{BoxedStream, Endpoint};
pub use error::{Error, Result};
pub use logging::setup_logging;
