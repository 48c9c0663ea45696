//! Transport endpoints for the hotplug service
//!
//! The service listens on vsock inside the platform, but the same protocol
//! runs over TCP and Unix sockets for development and tests. Endpoints are
//! written as `tcp:HOST:PORT`, `unix:/path/to/socket` or `vsock:CID:PORT`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Host CID as seen from a guest VM
pub const VSOCK_CID_HOST: u32 = 2;

/// Port the hotplug API listens on
pub const DEFAULT_API_PORT: u32 = 2000;

/// Any bidirectional async byte stream
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Connected transport, independent of the socket family
pub type BoxedStream = Box<dyn Stream>;

/// Address of a hotplug service socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    /// `host:port`, resolved at connect time
    Tcp(String),
    Unix(PathBuf),
    Vsock { cid: u32, port: u32 },
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::Vsock {
            cid: VSOCK_CID_HOST,
            port: DEFAULT_API_PORT,
        }
    }
}

impl Endpoint {
    /// Open a fresh connection to this endpoint
    pub async fn connect(&self) -> Result<BoxedStream> {
        debug!("Connecting to {}", self);
        match self {
            Self::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Self::Unix(_) => Err(Error::Network(
                "Unix sockets are not supported on this platform".to_string(),
            )),
            Self::Vsock { cid, port } => connect_vsock(*cid, *port).await,
        }
    }
}

#[cfg(all(target_os = "linux", feature = "vsock"))]
async fn connect_vsock(cid: u32, port: u32) -> Result<BoxedStream> {
    use tokio_vsock::{VsockAddr, VsockStream};

    let stream = VsockStream::connect(VsockAddr::new(cid, port)).await?;
    Ok(Box::new(stream))
}

#[cfg(not(all(target_os = "linux", feature = "vsock")))]
async fn connect_vsock(cid: u32, port: u32) -> Result<BoxedStream> {
    Err(Error::Network(format!(
        "cannot reach vsock:{}:{}: built without the `vsock` feature",
        cid, port
    )))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp:{}", addr),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Vsock { cid, port } => write!(f, "vsock:{}:{}", cid, port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidEndpoint(s.to_string(), reason.to_string());

        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected SCHEME:ADDRESS"))?;

        match scheme {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| invalid("expected tcp:HOST:PORT"))?;
                if host.is_empty() {
                    return Err(invalid("empty host"));
                }
                port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
                Ok(Self::Tcp(rest.to_string()))
            }
            "unix" => {
                if rest.is_empty() {
                    return Err(invalid("empty socket path"));
                }
                Ok(Self::Unix(PathBuf::from(shellexpand::tilde(rest).as_ref())))
            }
            "vsock" => {
                let (cid, port) = rest
                    .split_once(':')
                    .ok_or_else(|| invalid("expected vsock:CID:PORT"))?;
                let cid = cid.parse().map_err(|_| invalid("invalid CID"))?;
                let port = port.parse().map_err(|_| invalid("invalid port"))?;
                Ok(Self::Vsock { cid, port })
            }
            _ => Err(invalid("unknown scheme, expected tcp, unix or vsock")),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_each_scheme() {
        assert_eq!(
            "tcp:127.0.0.1:2000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:2000".to_string())
        );
        assert_eq!(
            "tcp:[::1]:2000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("[::1]:2000".to_string())
        );
        assert_eq!(
            "unix:/run/vhotplug.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/run/vhotplug.sock"))
        );
        assert_eq!(
            "vsock:2:2000".parse::<Endpoint>().unwrap(),
            Endpoint::Vsock { cid: 2, port: 2000 }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for bad in [
            "",
            "2000",
            "http:localhost:80",
            "tcp:localhost",
            "tcp::2000",
            "tcp:localhost:99999",
            "unix:",
            "vsock:2",
            "vsock:host:2000",
        ] {
            assert!(bad.parse::<Endpoint>().is_err(), "accepted '{}'", bad);
        }
    }

    #[test]
    fn test_display_matches_parse() {
        for text in ["tcp:localhost:2000", "unix:/tmp/hp.sock", "vsock:2:2000"] {
            let endpoint: Endpoint = text.parse().unwrap();
            assert_eq!(endpoint.to_string(), text);
        }
    }

    #[test]
    fn test_default_is_host_vsock() {
        assert_eq!(Endpoint::default().to_string(), "vsock:2:2000");
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = Endpoint::Tcp(addr.to_string());
        assert!(endpoint.connect().await.is_err());
    }

    #[cfg(not(feature = "vsock"))]
    #[tokio::test]
    async fn test_vsock_without_feature() {
        let err = Endpoint::default().connect().await.err().unwrap();
        assert!(err.to_string().contains("vsock"));
    }
}
