//! Protocol library for usb-applet
//!
//! This crate defines the wire protocol spoken with the hotplug service: the
//! control-channel commands and replies, the push messages delivered on the
//! notification channel, the newline-delimited JSON codec and the
//! classification of the service's heterogeneous reply shapes.
//!
//! # Example
//!
//! ```
//! use protocol::{Command, Outcome, classify, decode_reply, encode_command};
//!
//! let line = encode_command(&Command::Detach {
//!     device_node: "/dev/bus/usb/001/002".to_string(),
//! })
//! .unwrap();
//! assert!(line.ends_with(b"\n"));
//!
//! let reply = decode_reply(br#"{"event":"usb_detached"}"#).unwrap();
//! assert_eq!(classify(&reply, Some("usb_detached")), Outcome::Success);
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod outcome;

pub use codec::{
    MAX_LINE_SIZE, decode_push, decode_reply, encode_command, encode_push, encode_reply,
};

#[cfg(feature = "async")]
pub use codec::{read_line_async, write_line_async};
pub use error::{ProtocolError, Result};
pub use messages::{
    ATTACHED_EVENT, Command, DETACHED_EVENT, PushMessage, RawDevice, Reply, SELECT_VM_EVENT,
};
pub use outcome::{Outcome, UNKNOWN_ERROR, classify};
