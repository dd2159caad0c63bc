//! Inbound/outbound gateway message types (§6 "Recognized ... message types").

use crate::scope::ScopeHeader;

/// A message delivered to the application via `receive()`.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// `http.request {body, more_body}`
    HttpRequest { body: Vec<u8>, more_body: bool },
    /// `http.disconnect {}`
    HttpDisconnect,
    /// `websocket.connect {}`
    WebSocketConnect,
    /// `websocket.receive {text? | bytes?}`
    WebSocketReceive(WebSocketData),
    /// `websocket.disconnect {code}`
    WebSocketDisconnect { code: u16 },
}

#[derive(Debug, Clone)]
pub enum WebSocketData {
    Text(String),
    Bytes(Vec<u8>),
}

/// A message the application hands to `send()`.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// `http.response.start {status, headers}`
    HttpResponseStart {
        status: u16,
        headers: Vec<ScopeHeader>,
    },
    /// `http.response.body {body, more_body}`
    HttpResponseBody { body: Vec<u8>, more_body: bool },
    /// `websocket.accept {subprotocol?}`
    WebSocketAccept { subprotocol: Option<String> },
    /// `websocket.send {text? | bytes?}`
    WebSocketSend(WebSocketData),
    /// `websocket.close {code?}`
    WebSocketClose { code: Option<u16> },
}

impl OutboundMessage {
    /// The `type` string this message would carry over the wire, used only
    /// for log lines and error messages — the dispatcher matches on the
    /// enum variant directly, not this string.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::HttpResponseStart { .. } => "http.response.start",
            OutboundMessage::HttpResponseBody { .. } => "http.response.body",
            OutboundMessage::WebSocketAccept { .. } => "websocket.accept",
            OutboundMessage::WebSocketSend(_) => "websocket.send",
            OutboundMessage::WebSocketClose { .. } => "websocket.close",
        }
    }
}
