//! The immutable per-connection [`Scope`] handed to the application (§3).

use std::net::SocketAddr;

/// `(address, port)` pair as the gateway contract hands it to the
/// application — a plain tuple rather than a `SocketAddr` because the
/// address may come from a proxy header and not parse as one.
pub type Address = (String, u16);

/// A single ordered header, with a lower-cased ASCII name.
///
/// The scope keeps headers as an ordered sequence of pairs rather than a
/// map: a client may repeat a header name, and the application needs to see
/// every occurrence in arrival order (§8 "Header ordering").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeHeader {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl ScopeHeader {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The immutable description of one connection, built exactly once and
/// never mutated afterward (§3 invariant).
#[derive(Debug, Clone)]
pub enum Scope {
    Http(HttpScope),
    WebSocket(WebSocketScope),
}

impl Scope {
    pub fn client(&self) -> &Address {
        match self {
            Scope::Http(s) => &s.client,
            Scope::WebSocket(s) => &s.client,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Scope::Http(s) => &s.path,
            Scope::WebSocket(s) => &s.path,
        }
    }

    pub fn headers(&self) -> &[ScopeHeader] {
        match self {
            Scope::Http(s) => &s.headers,
            Scope::WebSocket(s) => &s.headers,
        }
    }
}

/// Scope built for an HTTP request (§3, `type: "http"`).
#[derive(Debug, Clone)]
pub struct HttpScope {
    pub http_version: String,
    /// Upper-case ASCII, e.g. `GET`.
    pub method: String,
    /// Percent-decoded UTF-8 path.
    pub path: String,
    /// Raw path bytes exactly as sent on the wire.
    pub raw_path: Vec<u8>,
    pub root_path: String,
    pub scheme: String,
    /// Still percent-encoded, as bytes.
    pub query_string: Vec<u8>,
    pub headers: Vec<ScopeHeader>,
    pub client: Address,
    pub server: Address,
    /// `"3.0"` stamp for parity with the gateway contract's versioning
    /// convention (§4.5).
    pub asgi_version: String,
}

/// Scope built for a WebSocket connection (§3, `type: "websocket"`).
#[derive(Debug, Clone)]
pub struct WebSocketScope {
    pub path: String,
    pub raw_path: Vec<u8>,
    pub root_path: String,
    pub scheme: String,
    pub query_string: Vec<u8>,
    pub headers: Vec<ScopeHeader>,
    pub client: Address,
    pub server: Address,
    /// Client-proposed subprotocols, in the order offered.
    pub subprotocols: Vec<String>,
    pub asgi_version: String,
}

pub(crate) fn socket_addr_to_tuple(addr: SocketAddr) -> Address {
    (addr.ip().to_string(), addr.port())
}
