//! Reply classification
//!
//! The hotplug service reports success in two historical shapes: a
//! `"result": "ok"` field, or an `event` field carrying the command's success
//! token. [`classify`] folds both into one [`Outcome`].

use crate::messages::Reply;

/// Message used when the service declines without saying why
pub const UNKNOWN_ERROR: &str = "Unknown error!";

/// Normalized result of a control-channel exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The service carried out the command
    Success,
    /// The service refused; carries its message verbatim
    Declined(String),
    /// Neither a success signal nor an error was present
    Malformed(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Classify a reply against the command's expected success token
///
/// `expected_event` is `None` for commands that only ever answer with
/// `result`.
pub fn classify(reply: &Reply, expected_event: Option<&str>) -> Outcome {
    let result_ok = reply.result.as_deref() == Some("ok");
    let event_ok = matches!(
        (reply.event.as_deref(), expected_event),
        (Some(event), Some(expected)) if event == expected
    );
    if result_ok || event_ok {
        return Outcome::Success;
    }

    if let Some(message) = &reply.error {
        return Outcome::Declined(message.clone());
    }
    if reply.result.as_deref() == Some("error") {
        return Outcome::Declined(UNKNOWN_ERROR.to_string());
    }

    let reason = match (&reply.result, &reply.event) {
        (Some(result), _) => format!("unexpected result '{}'", result),
        (None, Some(event)) => format!("unexpected event '{}'", event),
        (None, None) => "reply carries neither result nor event".to_string(),
    };
    Outcome::Malformed(reason)
}
