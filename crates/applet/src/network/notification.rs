//! Push notification subscriber
//!
//! Runs on its own task for the lifetime of the process: connect, read one
//! line, decode, hand selection prompts to the callback, repeat. Any
//! disconnect or undecodable line drops the connection, waits a fixed delay
//! and starts over. There is no backoff growth and no retry ceiling; the
//! hotplug service is expected to come back eventually.

use common::{BoxedStream, Endpoint};
use protocol::{ProtocolError, PushMessage, RawDevice, decode_push, read_line_async};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ConnectionState;

/// Delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// The service wants the user to pick a VM for a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRequired {
    /// Device as pushed; fields are not normalized here
    pub device: RawDevice,
    pub allowed_vms: Vec<String>,
}

/// Decoded push message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    SelectionRequired(SelectionRequired),
    /// Any other tag, known or not
    Other { event: String },
}

impl From<PushMessage> for NotificationEvent {
    fn from(msg: PushMessage) -> Self {
        if msg.is_select_vm() {
            NotificationEvent::SelectionRequired(SelectionRequired {
                device: msg.usb_device.unwrap_or_default(),
                allowed_vms: msg.allowed_vms,
            })
        } else {
            NotificationEvent::Other { event: msg.event }
        }
    }
}

/// Why a connected session ended
enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Subscriber configuration; consumed by [`NotificationChannel::spawn`]
#[derive(Debug, Clone)]
pub struct NotificationChannel {
    endpoint: Endpoint,
    reconnect_delay: Duration,
}

impl NotificationChannel {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Start the subscriber loop on a dedicated task
    ///
    /// `callback` runs on that task, never on the caller's. Dropping the
    /// returned handle stops the loop.
    pub fn spawn<F>(self, callback: F) -> NotificationHandle
    where
        F: FnMut(SelectionRequired) + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(self.run(callback, state_tx, shutdown_rx));

        NotificationHandle {
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run<F>(
        self,
        mut callback: F,
        state: watch::Sender<ConnectionState>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: FnMut(SelectionRequired) + Send + 'static,
    {
        info!("Notification subscriber started for {}", self.endpoint);

        loop {
            if *shutdown.borrow() {
                break;
            }

            state.send_replace(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.endpoint.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    state.send_replace(ConnectionState::Connected);
                    info!("Notification channel connected to {}", self.endpoint);
                    match Self::session(stream, &mut callback, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            warn!("Notification channel lost: {}", reason);
                        }
                    }
                }
                Err(e) => {
                    warn!("Notification connect to {} failed: {}", self.endpoint, e);
                }
            }

            state.send_replace(ConnectionState::Disconnected);
            debug!("Reconnecting in {:?}", self.reconnect_delay);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        state.send_replace(ConnectionState::Disconnected);
        info!("Notification subscriber stopped");
    }

    async fn session<F>(
        stream: BoxedStream,
        callback: &mut F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd
    where
        F: FnMut(SelectionRequired),
    {
        let mut reader = BufReader::new(stream);
        loop {
            let read = tokio::select! {
                _ = shutdown.changed() => return SessionEnd::Shutdown,
                read = read_line_async(&mut reader) => read,
            };

            let line = match read {
                Ok(line) => line,
                Err(e) if e.is_transport() => return SessionEnd::Lost(e.to_string()),
                Err(e) => {
                    warn!("Skipping notification: {}", e);
                    continue;
                }
            };

            let message = match decode_push(&line) {
                Ok(message) => message,
                Err(ProtocolError::Serialization(e)) if e.is_data() => {
                    // Valid JSON in an unexpected shape; the stream itself is fine
                    warn!("Skipping malformed notification: {}", e);
                    continue;
                }
                Err(e) => return SessionEnd::Lost(format!("undecodable notification: {}", e)),
            };

            match NotificationEvent::from(message) {
                NotificationEvent::SelectionRequired(event) => {
                    debug!(
                        "Selection required for {:?} among {:?}",
                        event.device.device_node, event.allowed_vms
                    );
                    callback(event);
                }
                NotificationEvent::Other { event } => {
                    info!("Device notification <{}> ignored", event);
                }
            }
        }
    }
}

/// Handle to a running subscriber
pub struct NotificationHandle {
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NotificationHandle {
    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.join().await;
    }

    /// Wait for the loop to exit without asking it to stop
    pub async fn join(self) {
        // Keep the shutdown sender alive; dropping it would stop the loop
        let NotificationHandle { shutdown, task, .. } = self;
        if let Err(e) = task.await {
            warn!("Notification task ended abnormally: {}", e);
        }
        drop(shutdown);
    }
}
