//! Control channel to the hotplug service
//!
//! One command out, exactly one reply back. The stream sits behind a mutex
//! that is held for the whole exchange, so requests on one channel are
//! strictly serialized. A request dropped mid-exchange takes the stream with
//! it, so a late reply can never be matched to the next command.

use common::{BoxedStream, Endpoint};
use protocol::{Command, Reply, decode_reply, encode_command, read_line_async, write_line_async};
use std::future::Future;
use tokio::io::BufReader;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, trace, warn};

use super::ConnectionState;
use crate::error::ChannelError;

/// Request/reply transport the coordinator is generic over
pub trait ControlTransport: Send + Sync + 'static {
    /// Send one command and wait for its reply
    fn request(&self, command: Command) -> impl Future<Output = Result<Reply, ChannelError>> + Send;
}

/// Control channel over any [`Endpoint`]
///
/// The channel never retries on its own. After a transport failure, or when
/// a request is dropped mid-exchange, it is `Disconnected` until
/// [`ControlChannel::connect`] is called again.
pub struct ControlChannel {
    endpoint: Endpoint,
    stream: Mutex<Option<BufReader<BoxedStream>>>,
    state: watch::Sender<ConnectionState>,
}

/// Marks the channel disconnected unless the exchange ran to completion
///
/// A cancelled exchange may leave a reply in flight, so its stream is never
/// reused.
struct InFlight<'a> {
    state: &'a watch::Sender<ConnectionState>,
    completed: bool,
}

impl InFlight<'_> {
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }
}

impl ControlChannel {
    /// Create an unconnected channel
    pub fn new(endpoint: Endpoint) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint,
            stream: Mutex::new(None),
            state,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Establish the transport
    ///
    /// No-op when already connected.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let mut stream = self.stream.lock().await;
        if stream.is_some() {
            debug!("Control channel to {} already connected", self.endpoint);
            return Ok(());
        }

        self.state.send_replace(ConnectionState::Connecting);
        match self.endpoint.connect().await {
            Ok(conn) => {
                *stream = Some(BufReader::new(conn));
                self.state.send_replace(ConnectionState::Connected);
                info!("Control channel connected to {}", self.endpoint);
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                warn!("Control channel connect to {} failed: {}", self.endpoint, e);
                Err(ChannelError::Transport(e.to_string()))
            }
        }
    }

    /// Drop the connection, if any
    pub async fn close(&self) {
        let mut stream = self.stream.lock().await;
        if stream.take().is_some() {
            info!("Closing control channel to {}", self.endpoint);
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn exchange(&self, command: &Command) -> Result<Reply, ChannelError> {
        let line = encode_command(command).map_err(|e| ChannelError::Protocol(e.to_string()))?;

        let mut guard = self.stream.lock().await;
        // Held outside the slot until the reply is read; dropped with the
        // future if the caller gives up
        let Some(mut stream) = guard.take() else {
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(ChannelError::Transport("not connected".to_string()));
        };
        let in_flight = InFlight {
            state: &self.state,
            completed: false,
        };
        debug!("-> {}", String::from_utf8_lossy(&line).trim_end());

        let sent = write_line_async(stream.get_mut(), &line).await;
        let received = match sent {
            Ok(()) => read_line_async(&mut stream).await,
            Err(e) => Err(e),
        };

        let reply_line = match received {
            Ok(line) => line,
            Err(e) if e.is_transport() => {
                warn!("Control channel to {} lost: {}", self.endpoint, e);
                return Err(ChannelError::Transport(e.to_string()));
            }
            Err(e) => {
                // The oversized line was consumed; the stream is still aligned
                *guard = Some(stream);
                in_flight.complete();
                return Err(ChannelError::Protocol(e.to_string()));
            }
        };
        *guard = Some(stream);
        in_flight.complete();
        trace!("<- {}", String::from_utf8_lossy(&reply_line));

        decode_reply(&reply_line).map_err(|e| ChannelError::Protocol(e.to_string()))
    }
}

impl ControlTransport for ControlChannel {
    async fn request(&self, command: Command) -> Result<Reply, ChannelError> {
        debug!("Control request: {}", command.name());
        self.exchange(&command).await
    }
}
