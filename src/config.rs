//! Server configuration (§6 of the recognized configuration options).

use std::time::Duration;

/// Runtime configuration shared by every connection the orchestrator accepts.
///
/// Constructed with [`Config::default`] and adjusted with the builder
/// methods.
#[derive(Debug, Clone)]
pub struct Config {
    /// Max seconds for an HTTP request to produce a response.
    pub http_timeout: Duration,
    /// Body read chunk size, in bytes.
    pub request_buffer_size: usize,
    /// Capacity of each connection's inbound application queue. A full
    /// queue is a hard backpressure error, not something producers block
    /// on (§4.3/§7 "Backpressure").
    pub inbound_queue_capacity: usize,
    /// Max WebSocket lifetime. `None` disables the bound.
    pub websocket_timeout: Option<Duration>,
    /// Max seconds in `Connecting` before an automatic 403 reject.
    pub websocket_connect_timeout: Duration,
    /// Max seconds to complete the HTTP side of the handshake.
    pub websocket_handshake_timeout: Duration,
    /// Idle seconds before an automatic WebSocket ping is sent.
    pub ping_interval: Duration,
    /// Seconds to wait for a pong before closing.
    pub ping_timeout: Duration,
    /// Grace period after disconnect before the application task is cancelled.
    pub application_close_timeout: Duration,
    /// `X-Forwarded-For`-style address header name. Empty disables proxy parsing.
    pub proxy_forwarded_address_header: Option<String>,
    /// `X-Forwarded-Port`-style port header name.
    pub proxy_forwarded_port_header: Option<String>,
    /// `X-Forwarded-Proto`-style scheme header name.
    pub proxy_forwarded_proto_header: Option<String>,
    /// Default gateway-contract `root_path`, overridable per request by a header.
    pub root_path: String,
    /// Default `Server:` header value.
    pub server_name: String,
    /// Reaper sweep cadence (§4.6): once per second in the distilled spec.
    pub reaper_interval: Duration,
    /// Timeout/ping sweep cadence (§4.7): once every two seconds.
    pub timeout_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(120),
            request_buffer_size: 8192,
            inbound_queue_capacity: 256,
            websocket_timeout: Some(Duration::from_secs(86400)),
            websocket_connect_timeout: Duration::from_secs(5),
            websocket_handshake_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(30),
            application_close_timeout: Duration::from_secs(10),
            proxy_forwarded_address_header: None,
            proxy_forwarded_port_header: None,
            proxy_forwarded_proto_header: None,
            root_path: String::new(),
            server_name: format!("netgate/{}", env!("CARGO_PKG_VERSION")),
            reaper_interval: Duration::from_secs(1),
            timeout_sweep_interval: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Enables `X-Forwarded-For`/`X-Forwarded-Port`/`X-Forwarded-Proto` parsing
    /// with the conventional header names.
    pub fn with_proxy_headers(mut self) -> Self {
        self.proxy_forwarded_address_header = Some("X-Forwarded-For".to_string());
        self.proxy_forwarded_port_header = Some("X-Forwarded-Port".to_string());
        self.proxy_forwarded_proto_header = Some("X-Forwarded-Proto".to_string());
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_websocket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.websocket_timeout = timeout;
        self
    }

    pub fn with_root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = root_path.into();
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Validates cross-field invariants that can't be expressed in the type
    /// alone. There are none yet beyond sane bounds, but this is the seam a
    /// CLI frontend should call before [`crate::server::Server::bind`].
    pub fn validate(&self) -> Result<(), crate::error::GatewayError> {
        if self.request_buffer_size == 0 {
            return Err(crate::error::GatewayError::Fatal(
                "request_buffer_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
