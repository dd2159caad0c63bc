//! C3 — WebSocket protocol state machine (§4.3).
//!
//! Handshake decision and open-connection duplex messaging share one
//! connection id and one event channel: the application's first reply
//! (`websocket.accept` or `websocket.close`) decides the HTTP-level
//! handshake response, and — only on accept — the same receiver is moved
//! into the post-upgrade duplex loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::{Response, StatusCode};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::access::{self, Action, AccessLogEntry};
use crate::app::{self, Application};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::http::ResponseBody;
use crate::message::{InboundMessage, OutboundMessage, WebSocketData};
use crate::registry::{ConnHandle, ConnId, Registry};
use crate::scope::{Address, Scope, ScopeHeader, WebSocketScope};

const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn sign_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(HANDSHAKE_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum TimeoutKind {
    Connect,
    PingDue,
    PongOverdue,
    Lifetime,
}

enum WsEvent {
    Accept { subprotocol: Option<String> },
    Reject,
    Send(WebSocketData),
    Close(Option<u16>),
    Timeout(TimeoutKind),
}

struct WsTimers {
    connected_at: Instant,
    last_activity: Instant,
    ping_outstanding_since: Option<Instant>,
}

pub(crate) struct WsShared {
    conn_id: ConnId,
    events_tx: mpsc::UnboundedSender<WsEvent>,
    phase: Mutex<Phase>,
    timers: Mutex<WsTimers>,
    connect_timeout: Duration,
    ping_interval: Duration,
    ping_timeout: Duration,
    lifetime: Option<Duration>,
}

impl WsShared {
    fn new(conn_id: ConnId, events_tx: mpsc::UnboundedSender<WsEvent>, config: &Config) -> Self {
        let now = Instant::now();
        Self {
            conn_id,
            events_tx,
            phase: Mutex::new(Phase::Connecting),
            timers: Mutex::new(WsTimers {
                connected_at: now,
                last_activity: now,
                ping_outstanding_since: None,
            }),
            connect_timeout: config.websocket_connect_timeout,
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            lifetime: config.websocket_timeout,
        }
    }

    fn touch(&self) {
        let mut timers = self.timers.lock().unwrap();
        timers.last_activity = Instant::now();
        timers.ping_outstanding_since = None;
    }

    fn note_ping_sent(&self) {
        self.timers.lock().unwrap().ping_outstanding_since = Some(Instant::now());
    }
}

impl ConnHandle for WsShared {
    fn handle_reply(&self, message: OutboundMessage) -> Result<(), GatewayError> {
        let mut phase = self.phase.lock().unwrap();
        match message {
            OutboundMessage::WebSocketAccept { subprotocol } => {
                if *phase != Phase::Connecting {
                    return Err(GatewayError::GatewayContract(
                        "websocket.accept sent after the handshake was already decided".into(),
                    ));
                }
                *phase = Phase::Open;
                drop(phase);
                let _ = self.events_tx.send(WsEvent::Accept { subprotocol });
                Ok(())
            }
            OutboundMessage::WebSocketClose { code } => match *phase {
                Phase::Connecting => {
                    *phase = Phase::Closed;
                    drop(phase);
                    let _ = self.events_tx.send(WsEvent::Reject);
                    Ok(())
                }
                Phase::Open => {
                    *phase = Phase::Closing;
                    drop(phase);
                    let _ = self.events_tx.send(WsEvent::Close(code));
                    Ok(())
                }
                Phase::Closing | Phase::Closed => Err(GatewayError::GatewayContract(
                    "websocket.close sent after the connection already closed".into(),
                )),
            },
            OutboundMessage::WebSocketSend(data) => {
                match *phase {
                    Phase::Connecting => {
                        // A bare send before accept implicitly accepts with
                        // no subprotocol (§4.3).
                        *phase = Phase::Open;
                        drop(phase);
                        let _ = self.events_tx.send(WsEvent::Accept { subprotocol: None });
                        let _ = self.events_tx.send(WsEvent::Send(data));
                        Ok(())
                    }
                    Phase::Open => {
                        drop(phase);
                        let _ = self.events_tx.send(WsEvent::Send(data));
                        Ok(())
                    }
                    Phase::Closing | Phase::Closed => Err(GatewayError::GatewayContract(
                        "websocket.send sent after close".into(),
                    )),
                }
            }
            other => Err(GatewayError::GatewayContract(format!(
                "{} is not valid on a websocket connection",
                other.type_name()
            ))),
        }
    }

    fn check_timeouts(&self, now: Instant) {
        let phase = *self.phase.lock().unwrap();
        match phase {
            Phase::Connecting => {
                let timers = self.timers.lock().unwrap();
                if now.saturating_duration_since(timers.connected_at) > self.connect_timeout {
                    drop(timers);
                    let _ = self.events_tx.send(WsEvent::Timeout(TimeoutKind::Connect));
                }
            }
            Phase::Open => {
                let timers = self.timers.lock().unwrap();
                if let Some(lifetime) = self.lifetime {
                    if now.saturating_duration_since(timers.connected_at) > lifetime {
                        drop(timers);
                        let _ = self.events_tx.send(WsEvent::Timeout(TimeoutKind::Lifetime));
                        return;
                    }
                }
                if let Some(since) = timers.ping_outstanding_since {
                    if now.saturating_duration_since(since) > self.ping_timeout {
                        drop(timers);
                        let _ = self.events_tx.send(WsEvent::Timeout(TimeoutKind::PongOverdue));
                        return;
                    }
                } else if now.saturating_duration_since(timers.last_activity) > self.ping_interval {
                    drop(timers);
                    let _ = self.events_tx.send(WsEvent::Timeout(TimeoutKind::PingDue));
                }
            }
            Phase::Closing | Phase::Closed => {}
        }
    }

    fn on_reaped(&self) {
        *self.phase.lock().unwrap() = Phase::Closed;
    }
}

/// Parameters gathered by C2's `UPGRADE_CHECK` step, carried across the
/// transport hand-off.
pub(crate) struct UpgradeRequest {
    pub headers: Vec<ScopeHeader>,
    pub path: String,
    pub raw_path: Vec<u8>,
    pub root_path: String,
    pub query_string: Vec<u8>,
    pub client: Address,
    pub server: Address,
    pub scheme: String,
    pub subprotocols: Vec<String>,
    pub sec_websocket_key: Option<String>,
    pub on_upgrade: hyper::upgrade::OnUpgrade,
}

static NEXT_LOG_ID: AtomicU64 = AtomicU64::new(1);

/// Drives the handshake decision and, on acceptance, spawns the open
/// connection's duplex loop. Returns the HTTP-level response: `101` on
/// accept, `403` on reject, timeout, or a dropped application.
pub(crate) async fn handle_upgrade(
    req: UpgradeRequest,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    config: Arc<Config>,
    application: Arc<dyn Application>,
) -> Response<ResponseBody> {
    let _ = NEXT_LOG_ID.fetch_add(1, Ordering::Relaxed);

    let scope = WebSocketScope {
        path: req.path,
        raw_path: req.raw_path,
        root_path: req.root_path,
        scheme: req.scheme,
        query_string: req.query_string,
        headers: req.headers,
        client: req.client.clone(),
        server: req.server,
        subprotocols: req.subprotocols,
        asgi_version: "3.0".to_string(),
    };

    let conn_id = registry.next_id();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<WsEvent>();
    let shared = Arc::new(WsShared::new(conn_id, events_tx, &config));
    registry.register(conn_id, shared.clone());

    let (queue_tx, mut app_ended) = app::create_application(
        conn_id,
        registry.clone(),
        dispatcher,
        Scope::WebSocket(scope.clone()),
        application,
        config.inbound_queue_capacity,
    );

    access::log_action(
        Action::WebSocketConnecting,
        AccessLogEntry {
            host: Some(req.client.0.clone()),
            path: &scope.path,
            method: None,
            status: None,
            size: None,
        },
    );

    if queue_tx.try_send(InboundMessage::WebSocketConnect).is_err() {
        // Inbound queue is already full: force-close at the handshake
        // layer rather than waiting on an application that can't be
        // reached (§4.3/§7 "Backpressure").
        registry.mark_disconnected(conn_id);
        access::log_action(
            Action::WebSocketRejected,
            AccessLogEntry {
                host: Some(req.client.0.clone()),
                path: &scope.path,
                method: None,
                status: Some(503),
                size: None,
            },
        );
        return Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(ResponseBody::full(Bytes::new()))
            .unwrap_or_else(|_| Response::new(ResponseBody::full(Bytes::new())));
    }

    let decision = tokio::select! {
        ev = events_rx.recv() => Decision::Event(ev),
        _ = app_ended.changed() => Decision::AppEnded(app_ended.borrow_and_update().clone()),
    };

    match decision {
        Decision::Event(Some(WsEvent::Accept { subprotocol })) => {
            let accept_key = req
                .sec_websocket_key
                .as_deref()
                .map(sign_accept_key)
                .unwrap_or_default();

            let mut builder = Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(http::header::CONNECTION, "Upgrade")
                .header(http::header::UPGRADE, "websocket")
                .header("Sec-WebSocket-Accept", accept_key);
            if let Some(proto) = &subprotocol {
                builder = builder.header("Sec-WebSocket-Protocol", proto.clone());
            }
            let response = builder
                .body(ResponseBody::full(Bytes::new()))
                .unwrap_or_else(|_| Response::new(ResponseBody::full(Bytes::new())));

            access::log_action(
                Action::WebSocketConnected,
                AccessLogEntry {
                    host: Some(req.client.0.clone()),
                    path: &scope.path,
                    method: None,
                    status: Some(101),
                    size: None,
                },
            );

            let registry2 = registry.clone();
            let on_upgrade = req.on_upgrade;
            let queue_tx2 = queue_tx.clone();
            let path = scope.path.clone();
            let handshake_timeout = config.websocket_handshake_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(handshake_timeout, on_upgrade).await {
                    Ok(Ok(upgraded)) => {
                        run_open_connection(
                            upgraded, events_rx, queue_tx2, registry2, conn_id, shared, path, app_ended,
                        )
                        .await;
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(conn_id, error = %err, "websocket upgrade handshake failed");
                        registry2.mark_disconnected(conn_id);
                        let _ = queue_tx2.try_send(InboundMessage::WebSocketDisconnect { code: 1006 });
                    }
                    Err(_) => {
                        tracing::warn!(conn_id, "websocket upgrade handshake timed out");
                        registry2.mark_disconnected(conn_id);
                        let _ = queue_tx2.try_send(InboundMessage::WebSocketDisconnect { code: 1006 });
                    }
                }
            });

            response
        }
        Decision::Event(Some(WsEvent::Reject)) | Decision::Event(Some(WsEvent::Timeout(_))) | Decision::Event(None) => {
            registry.mark_disconnected(conn_id);
            access::log_action(
                Action::WebSocketRejected,
                AccessLogEntry {
                    host: Some(req.client.0.clone()),
                    path: &scope.path,
                    method: None,
                    status: Some(403),
                    size: None,
                },
            );
            Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(ResponseBody::full(Bytes::new()))
                .unwrap_or_else(|_| Response::new(ResponseBody::full(Bytes::new())))
        }
        Decision::Event(Some(WsEvent::Send(_))) | Decision::Event(Some(WsEvent::Close(_))) => {
            // Contract violation (send/close-with-code before accept is
            // guarded in handle_reply) — unreachable in practice.
            registry.mark_disconnected(conn_id);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(ResponseBody::full(Bytes::new()))
                .unwrap_or_else(|_| Response::new(ResponseBody::full(Bytes::new())))
        }
        Decision::AppEnded(outcome) => {
            // The application ended (normally or via panic) before deciding
            // accept/reject; no 101 has gone out, so this is still an
            // ordinary HTTP response (§4.2 "emits a 500 if no response has
            // started").
            if let Some(app::AppOutcome::Panicked(msg)) = &outcome {
                tracing::error!(conn_id, error = %msg, "application task panicked before the websocket handshake was decided");
            }
            registry.mark_disconnected(conn_id);
            access::log_action(
                Action::WebSocketRejected,
                AccessLogEntry {
                    host: Some(req.client.0.clone()),
                    path: &scope.path,
                    method: None,
                    status: Some(500),
                    size: None,
                },
            );
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(ResponseBody::full(Bytes::new()))
                .unwrap_or_else(|_| Response::new(ResponseBody::full(Bytes::new())))
        }
    }
}

enum Decision {
    Event(Option<WsEvent>),
    AppEnded(Option<app::AppOutcome>),
}

async fn run_open_connection(
    upgraded: hyper::upgrade::Upgraded,
    mut events_rx: mpsc::UnboundedReceiver<WsEvent>,
    queue_tx: app::QueueProducer,
    registry: Arc<Registry>,
    conn_id: ConnId,
    shared: Arc<WsShared>,
    path: String,
    mut app_ended: app::AppEndedRx,
) {
    let io = hyper_util::rt::TokioIo::new(upgraded);
    let mut stream = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
    let mut final_code: u16 = 1006;
    // Set once the inbound queue refuses a message; further frames are
    // dropped and the disconnect notification is suppressed (§7 "Muted").
    let mut muted = false;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if muted => { shared.touch(); let _ = text; }
                    Some(Ok(Message::Text(text))) => {
                        shared.touch();
                        if queue_tx
                            .try_send(InboundMessage::WebSocketReceive(WebSocketData::Text(text.to_string())))
                            .is_err()
                        {
                            muted = true;
                            final_code = 1013;
                            let _ = stream
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::from(1013),
                                    reason: "inbound queue full".into(),
                                })))
                                .await;
                        }
                    }
                    Some(Ok(Message::Binary(data))) if muted => { shared.touch(); let _ = data; }
                    Some(Ok(Message::Binary(data))) => {
                        shared.touch();
                        if queue_tx
                            .try_send(InboundMessage::WebSocketReceive(WebSocketData::Bytes(data.to_vec())))
                            .is_err()
                        {
                            muted = true;
                            final_code = 1013;
                            let _ = stream
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::from(1013),
                                    reason: "inbound queue full".into(),
                                })))
                                .await;
                        }
                    }
                    Some(Ok(Message::Ping(_))) => shared.touch(),
                    Some(Ok(Message::Pong(_))) => shared.touch(),
                    Some(Ok(Message::Close(frame))) => {
                        final_code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(_)) | None => break,
                }
            }
            event = events_rx.recv() => {
                match event {
                    Some(WsEvent::Send(WebSocketData::Text(text))) => {
                        if stream.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(WsEvent::Send(WebSocketData::Bytes(bytes))) => {
                        if stream.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(WsEvent::Close(code)) => {
                        final_code = code.unwrap_or(1000);
                        let frame = code.map(|c| CloseFrame {
                            code: CloseCode::from(c),
                            reason: "".into(),
                        });
                        let _ = stream.send(Message::Close(frame)).await;
                        break;
                    }
                    Some(WsEvent::Timeout(TimeoutKind::PingDue)) => {
                        if stream.send(Message::Ping(Bytes::new().into())).await.is_err() {
                            break;
                        }
                        shared.note_ping_sent();
                    }
                    Some(WsEvent::Timeout(TimeoutKind::PongOverdue)) => {
                        final_code = 1011;
                        let _ = stream
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(1011),
                                reason: "ping timeout".into(),
                            })))
                            .await;
                        break;
                    }
                    Some(WsEvent::Timeout(TimeoutKind::Lifetime)) => {
                        final_code = 1001;
                        let _ = stream
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(1001),
                                reason: "connection lifetime exceeded".into(),
                            })))
                            .await;
                        break;
                    }
                    Some(WsEvent::Timeout(TimeoutKind::Connect))
                    | Some(WsEvent::Accept { .. })
                    | Some(WsEvent::Reject)
                    | None => break,
                }
            }
            changed = app_ended.changed() => {
                if changed.is_err() {
                    break;
                }
                let outcome = app_ended.borrow_and_update().clone();
                if let Some(app::AppOutcome::Panicked(msg)) = outcome {
                    tracing::error!(conn_id, error = %msg, "application task panicked");
                    final_code = 1011;
                    let _ = stream
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(1011),
                            reason: "application error".into(),
                        })))
                        .await;
                } else {
                    final_code = 1000;
                    let _ = stream.send(Message::Close(None)).await;
                }
                break;
            }
        }
    }

    registry.mark_disconnected(conn_id);
    if !muted {
        let _ = queue_tx.try_send(InboundMessage::WebSocketDisconnect { code: final_code });
    }
    access::log_action(
        Action::WebSocketDisconnected,
        AccessLogEntry {
            host: None,
            path: &path,
            method: None,
            status: Some(final_code),
            size: None,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            sign_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
