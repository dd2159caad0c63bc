//! The error taxonomy used throughout the connection lifecycle.
//!
//! Every variant maps to exactly one recovery action taken by the dispatcher
//! or orchestrator; see the module docs on [`crate::dispatch`] and
//! [`crate::registry`] for where each variant is produced and consumed.

/// Errors produced while parsing or running a single connection.
///
/// Transient variants ([`Timeout`](GatewayError::Timeout),
/// [`Backpressure`](GatewayError::Backpressure)) never escape the
/// connection that produced them. [`GatewayContract`](GatewayError::GatewayContract)
/// and [`Application`](GatewayError::Application) close only the affected
/// connection. [`Fatal`](GatewayError::Fatal) aborts the process.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed request bytes: non-ASCII path/query, broken upgrade request.
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    /// The application violated the outbound message shape (§6/§7): duplicate
    /// `response.start`, missing `status`, both `text` and `bytes` set, etc.
    #[error("gateway contract violation: {0}")]
    GatewayContract(String),

    /// A request, handshake, or connection lifetime bound elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The application's input queue could not accept a message.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// The peer went away mid-stream.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// The application task panicked or returned an error.
    #[error("application error: {0}")]
    Application(String),

    /// Startup misconfiguration severe enough to abort the process.
    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl GatewayError {
    /// The HTTP status this error maps to when it surfaces before a response
    /// has started.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::ClientProtocol(_) => 400,
            GatewayError::Timeout(_) => 503,
            GatewayError::Backpressure(_) => 503,
            GatewayError::GatewayContract(_) | GatewayError::Application(_) => 500,
            GatewayError::Transport(_) => 500,
            GatewayError::Fatal(_) => 500,
        }
    }

    /// The WebSocket close code this error maps to when it occurs on an
    /// already-open WebSocket connection.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            GatewayError::Backpressure(_) => 1013,
            GatewayError::GatewayContract(_) | GatewayError::Application(_) => 1011,
            _ => 1011,
        }
    }
}
