//! Test utilities for usb-applet
//!
//! Provides stand-ins for the hotplug service that speak the real wire
//! protocol over loopback TCP, plus helpers for async tests.
//!
//! # Example
//!
//! ```ignore
//! use common::test_utils::{MockHotplugService, MockResponse};
//! use protocol::Reply;
//!
//! # async fn demo() {
//! let service = MockHotplugService::start(|_cmd| MockResponse::Reply(Reply::ok())).await;
//! let endpoint = service.endpoint();
//! // ... connect a ControlChannel to `endpoint` ...
//! assert!(service.commands().is_empty());
//! # }
//! ```

use crate::Endpoint;
use protocol::{Command, PushMessage, Reply, encode_push, encode_reply};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What the mock service does with a received command
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Answer with a well-formed reply
    Reply(Reply),
    /// Answer with an arbitrary line (a newline is appended)
    Raw(String),
    /// Close the connection without answering
    Hangup,
    /// Answer with a well-formed reply after a pause
    Delayed(Reply, Duration),
}

type Responder = Arc<dyn Fn(&Command) -> MockResponse + Send + Sync>;

/// Scripted request/reply hotplug service
///
/// Every received command is recorded; the responder decides the reply.
/// Accepts any number of sequential connections.
pub struct MockHotplugService {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<Command>>>,
    task: JoinHandle<()>,
}

impl MockHotplugService {
    /// Bind to an ephemeral loopback port and start serving
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&Command) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock hotplug service");
        let addr = listener.local_addr().expect("Failed to read local addr");
        let commands = Arc::new(Mutex::new(Vec::new()));
        let responder: Responder = Arc::new(responder);

        let recorded = commands.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_control(stream, recorded.clone(), responder.clone()));
            }
        });

        Self {
            addr,
            commands,
            task,
        }
    }

    /// Service that always answers with the same reply
    pub async fn always(reply: Reply) -> Self {
        Self::start(move |_| MockResponse::Reply(reply.clone())).await
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::Tcp(self.addr.to_string())
    }

    /// Commands received so far, in arrival order
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Drop for MockHotplugService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_control(
    stream: TcpStream,
    commands: Arc<Mutex<Vec<Command>>>,
    responder: Responder,
) {
    let mut stream = BufReader::new(stream);
    while let Ok(line) = protocol::read_line_async(&mut stream).await {
        let Ok(command) = serde_json::from_slice::<Command>(&line) else {
            let _ = stream
                .get_mut()
                .write_all(b"{\"result\":\"error\",\"error\":\"bad command\"}\n")
                .await;
            continue;
        };
        if let Ok(mut seen) = commands.lock() {
            seen.push(command.clone());
        }

        let bytes = match responder(&command) {
            MockResponse::Reply(reply) => match encode_reply(&reply) {
                Ok(bytes) => bytes,
                Err(_) => return,
            },
            MockResponse::Delayed(reply, delay) => {
                tokio::time::sleep(delay).await;
                match encode_reply(&reply) {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                }
            }
            MockResponse::Raw(text) => format!("{}\n", text).into_bytes(),
            MockResponse::Hangup => return,
        };
        if stream.get_mut().write_all(&bytes).await.is_err() {
            return;
        }
    }
}

/// Push-only service for notification channel tests
///
/// Connections are accepted explicitly so a test controls exactly when a
/// subscriber is online.
pub struct MockPushService {
    listener: TcpListener,
}

impl MockPushService {
    /// Bind to an ephemeral loopback port
    pub async fn bind() -> Self {
        Self::bind_addr("127.0.0.1:0".parse().expect("valid addr")).await
    }

    /// Bind to a specific address, e.g. to come back on the same port
    pub async fn bind_addr(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr)
            .await
            .expect("Failed to bind mock push service");
        Self { listener }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("Failed to read local addr")
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::Tcp(self.local_addr().to_string())
    }

    /// Wait for the next subscriber to connect
    pub async fn accept(&self) -> PushConnection {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .expect("Failed to accept subscriber");
        PushConnection { stream }
    }
}

/// One connected subscriber
pub struct PushConnection {
    stream: TcpStream,
}

impl PushConnection {
    pub async fn send(&mut self, message: &PushMessage) -> std::io::Result<()> {
        let line = encode_push(message).map_err(std::io::Error::other)?;
        self.stream.write_all(&line).await
    }

    /// Send an arbitrary line (a newline is appended)
    pub async fn send_raw(&mut self, text: &str) -> std::io::Result<()> {
        self.stream.write_all(format!("{}\n", text).as_bytes()).await
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
