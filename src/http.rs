//! C2 — HTTP/1.1 request state machine (§4.2).
//!
//! `HEADERS_RECEIVED -> UPGRADE_CHECK -> SCOPE_BUILT -> STREAMING_BODY ->
//! AWAITING_RESPONSE -> RESPONDING -> DONE`, modeled as one hyper
//! [`Service`] call per request plus a detached body-forwarding task.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use http_body::{Body as HttpBody, Frame};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::Service;

use tokio::sync::mpsc;

use crate::access::{self, Action, AccessLogEntry};
use crate::app::{self, Application};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::message::{InboundMessage, OutboundMessage};
use crate::registry::{ConnHandle, ConnId, Registry};
use crate::scope::{Address, HttpScope, Scope, ScopeHeader};
use crate::ws;

/// Proxy-supplied override for the scope's `root_path` (§4.2 step 1,
/// §"REDESIGN FLAGS" — preserved verbatim as wire compatibility, not
/// otherwise special to this crate).
const ROOT_PATH_HEADER: &str = "daphne-root-path";

enum HttpEvent {
    Start { status: u16, headers: Vec<ScopeHeader> },
    Body { body: Vec<u8>, more_body: bool },
    Timeout,
    Backpressure,
    /// The application violated the outbound message shape (§4.2/§4.4).
    /// Carries the same text as the `Err` handed back to the application's
    /// `send()` call, so both sides of the contract see the same reason.
    Violation(String),
}

struct HttpState {
    responded: bool,
    finished: bool,
}

pub(crate) struct HttpShared {
    conn_id: ConnId,
    events_tx: mpsc::UnboundedSender<HttpEvent>,
    state: Mutex<HttpState>,
    created_at: Instant,
    http_timeout: Duration,
}

impl ConnHandle for HttpShared {
    fn handle_reply(&self, message: OutboundMessage) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        match message {
            OutboundMessage::HttpResponseStart { status, headers } => {
                if state.responded {
                    let msg = "http.response.start sent more than once".to_string();
                    drop(state);
                    let _ = self.events_tx.send(HttpEvent::Violation(msg.clone()));
                    return Err(GatewayError::GatewayContract(msg));
                }
                state.responded = true;
                let _ = self.events_tx.send(HttpEvent::Start { status, headers });
                Ok(())
            }
            OutboundMessage::HttpResponseBody { body, more_body } => {
                if !state.responded {
                    let msg = "http.response.body sent before http.response.start".to_string();
                    drop(state);
                    let _ = self.events_tx.send(HttpEvent::Violation(msg.clone()));
                    return Err(GatewayError::GatewayContract(msg));
                }
                if state.finished {
                    let msg = "http.response.body sent after the final chunk".to_string();
                    drop(state);
                    let _ = self.events_tx.send(HttpEvent::Violation(msg.clone()));
                    return Err(GatewayError::GatewayContract(msg));
                }
                if !more_body {
                    state.finished = true;
                }
                let _ = self.events_tx.send(HttpEvent::Body { body, more_body });
                Ok(())
            }
            other => Err(GatewayError::GatewayContract(format!(
                "{} is not valid on an http connection",
                other.type_name()
            ))),
        }
    }

    fn check_timeouts(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        if now.saturating_duration_since(self.created_at) <= self.http_timeout {
            return;
        }
        if !state.responded {
            drop(state);
            let _ = self.events_tx.send(HttpEvent::Timeout);
        } else if !state.finished {
            state.finished = true;
            drop(state);
            tracing::warn!(conn_id = self.conn_id, "http response exceeded timeout while streaming, forcing close");
            let _ = self.events_tx.send(HttpEvent::Body { body: Vec::new(), more_body: false });
        }
    }

    fn on_backpressure(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.responded {
            drop(state);
            let _ = self.events_tx.send(HttpEvent::Backpressure);
        } else if !state.finished {
            state.finished = true;
            drop(state);
            tracing::warn!(conn_id = self.conn_id, "inbound queue full while streaming, forcing close");
            let _ = self.events_tx.send(HttpEvent::Body { body: Vec::new(), more_body: false });
        }
    }
}

struct PendingLog {
    method: String,
    path: String,
    host: Option<String>,
    status: u16,
}

/// The response body type every request handled by this crate produces:
/// either a single pre-rendered buffer (errors, the WebSocket handshake
/// responses) or a live stream pulled from the application's replies.
pub struct ResponseBody {
    inner: ResponseBodyInner,
}

enum ResponseBodyInner {
    Full(Option<Bytes>),
    Streaming {
        rx: mpsc::UnboundedReceiver<HttpEvent>,
        app_ended: app::AppEndedRx,
        done: bool,
        size: u64,
        queue_tx: app::QueueProducer,
        registry: Arc<Registry>,
        conn_id: ConnId,
        log: Option<PendingLog>,
    },
}

impl ResponseBody {
    pub(crate) fn full(bytes: Bytes) -> Self {
        Self {
            inner: ResponseBodyInner::Full(Some(bytes)),
        }
    }

    fn streaming(
        rx: mpsc::UnboundedReceiver<HttpEvent>,
        app_ended: app::AppEndedRx,
        queue_tx: app::QueueProducer,
        registry: Arc<Registry>,
        conn_id: ConnId,
        log: PendingLog,
    ) -> Self {
        Self {
            inner: ResponseBodyInner::Streaming {
                rx,
                app_ended,
                done: false,
                size: 0,
                queue_tx,
                registry,
                conn_id,
                log: Some(log),
            },
        }
    }
}

impl HttpBody for ResponseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        let this = self.get_mut();
        match &mut this.inner {
            ResponseBodyInner::Full(slot) => Poll::Ready(slot.take().map(|b| Ok(Frame::data(b)))),
            ResponseBodyInner::Streaming {
                rx,
                app_ended,
                done,
                size,
                queue_tx,
                registry,
                conn_id,
                log,
            } => {
                if *done {
                    return Poll::Ready(None);
                }
                // The application task already finished; per §4.2 a response
                // in progress is simply finished rather than errored.
                if let Some(outcome) = app_ended.borrow_and_update().clone() {
                    if let app::AppOutcome::Panicked(msg) = outcome {
                        tracing::error!(conn_id = *conn_id, error = %msg, "application task panicked while streaming");
                    }
                    *done = true;
                    registry.mark_disconnected(*conn_id);
                    let _ = queue_tx.try_send(InboundMessage::HttpDisconnect);
                    return Poll::Ready(None);
                }
                match rx.poll_recv(cx) {
                    Poll::Ready(Some(HttpEvent::Body { body, more_body })) => {
                        *size += body.len() as u64;
                        if !more_body {
                            *done = true;
                            registry.mark_disconnected(*conn_id);
                            let _ = queue_tx.try_send(InboundMessage::HttpDisconnect);
                            if let Some(log) = log.take() {
                                access::log_action(
                                    Action::HttpComplete,
                                    AccessLogEntry {
                                        host: log.host,
                                        path: &log.path,
                                        method: Some(&log.method),
                                        status: Some(log.status),
                                        size: Some(*size),
                                    },
                                );
                            }
                        }
                        Poll::Ready(Some(Ok(Frame::data(Bytes::from(body)))))
                    }
                    Poll::Ready(Some(HttpEvent::Violation(msg))) => {
                        *done = true;
                        registry.mark_disconnected(*conn_id);
                        let _ = queue_tx.try_send(InboundMessage::HttpDisconnect);
                        tracing::error!(conn_id = *conn_id, error = %msg, "gateway contract violation while streaming, closing connection");
                        Poll::Ready(None)
                    }
                    Poll::Ready(Some(HttpEvent::Start { .. })) | Poll::Ready(Some(HttpEvent::Timeout)) | Poll::Ready(None) => {
                        *done = true;
                        registry.mark_disconnected(*conn_id);
                        let _ = queue_tx.try_send(InboundMessage::HttpDisconnect);
                        Poll::Ready(None)
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

fn http_version_string(version: http::Version) -> String {
    match version {
        http::Version::HTTP_09 => "0.9",
        http::Version::HTTP_10 => "1.0",
        http::Version::HTTP_2 => "2",
        http::Version::HTTP_3 => "3",
        _ => "1.1",
    }
    .to_string()
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::UPGRADE)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"websocket"))
        .unwrap_or(false)
}

/// Lowercases and drops underscore-containing header names (§4.2 step 1),
/// pulling the root-path override out of the sequence entirely.
fn clean_headers(headers: &HeaderMap) -> (Vec<ScopeHeader>, Option<String>) {
    let mut out = Vec::with_capacity(headers.len());
    let mut root_path = None;
    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if name_str.as_bytes().contains(&b'_') {
            continue;
        }
        if name_str.eq_ignore_ascii_case(ROOT_PATH_HEADER) {
            if let Ok(decoded) = percent_encoding::percent_decode(value.as_bytes()).decode_utf8() {
                root_path = Some(decoded.into_owned());
            }
            continue;
        }
        out.push(ScopeHeader::new(
            name_str.as_bytes().to_ascii_lowercase(),
            value.as_bytes().to_vec(),
        ));
    }
    (out, root_path)
}

fn render_error_page(status: u16, detail: &str) -> String {
    let title = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Error");
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{status} {title}</title></head>\n\
         <body>\n<h1>{status} {title}</h1>\n<p>{detail}</p>\n</body>\n</html>\n",
        status = status,
        title = title,
        detail = html_escape(detail),
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn error_response(err: &GatewayError, method: &str, path: &str, host: Option<String>) -> Response<ResponseBody> {
    let status = err.http_status();
    let page = render_error_page(status, &err.to_string());
    access::log_action(
        Action::HttpComplete,
        AccessLogEntry {
            host,
            path,
            method: Some(method),
            status: Some(status),
            size: Some(page.len() as u64),
        },
    );
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(ResponseBody::full(Bytes::from(page)))
        .unwrap_or_else(|_| Response::new(ResponseBody::full(Bytes::new())))
}

async fn stream_request_body(
    mut body: Incoming,
    queue_tx: app::QueueProducer,
    buffer_size: usize,
    registry: Arc<Registry>,
    conn_id: ConnId,
) {
    let mut buf = Vec::with_capacity(buffer_size);
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    buf.extend_from_slice(data);
                    while buf.len() >= buffer_size {
                        let chunk: Vec<u8> = buf.drain(..buffer_size).collect();
                        match queue_tx.try_send(InboundMessage::HttpRequest { body: chunk, more_body: true }) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                registry.force_backpressure(conn_id);
                                return;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                }
            }
            Some(Err(_)) => {
                registry.mark_disconnected(conn_id);
                let _ = queue_tx.try_send(InboundMessage::HttpDisconnect);
                return;
            }
            None => break,
        }
    }
    if let Err(mpsc::error::TrySendError::Full(_)) =
        queue_tx.try_send(InboundMessage::HttpRequest { body: buf, more_body: false })
    {
        registry.force_backpressure(conn_id);
    }
}

/// One instance per accepted TCP connection; `peer`/`local` are fixed at
/// construction, so [`Service::call`] only needs the request itself.
#[derive(Clone)]
pub struct HttpGateway {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    config: Arc<Config>,
    application: Arc<dyn Application>,
    peer: Address,
    local: Address,
}

impl HttpGateway {
    pub(crate) fn new(
        registry: Arc<Registry>,
        dispatcher: Dispatcher,
        config: Arc<Config>,
        application: Arc<dyn Application>,
        peer: Address,
        local: Address,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            config,
            application,
            peer,
            local,
        }
    }

    async fn serve(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        let (mut parts, body) = req.into_parts();

        let (headers, root_path_override) = clean_headers(&parts.headers);

        let raw_path = parts.uri.path().as_bytes().to_vec();
        if !raw_path.is_ascii() {
            return error_response(
                &GatewayError::ClientProtocol("invalid characters in path".into()),
                parts.method.as_str(),
                parts.uri.path(),
                None,
            );
        }
        let query_string = parts.uri.query().unwrap_or("").as_bytes().to_vec();
        if !query_string.is_ascii() {
            return error_response(
                &GatewayError::ClientProtocol("invalid characters in query string".into()),
                parts.method.as_str(),
                parts.uri.path(),
                None,
            );
        }
        let path = match percent_encoding::percent_decode(&raw_path).decode_utf8() {
            Ok(p) => p.into_owned(),
            Err(_) => {
                return error_response(
                    &GatewayError::ClientProtocol("path is not valid UTF-8".into()),
                    parts.method.as_str(),
                    parts.uri.path(),
                    None,
                )
            }
        };

        let (client, scheme) = crate::forwarded::resolve_client(
            &headers,
            self.config.proxy_forwarded_address_header.as_deref(),
            self.config.proxy_forwarded_port_header.as_deref(),
            self.config.proxy_forwarded_proto_header.as_deref(),
            &self.peer,
            "http",
        );
        let root_path = root_path_override.unwrap_or_else(|| self.config.root_path.clone());

        if is_websocket_upgrade(&parts.headers) {
            let subprotocols = parts
                .headers
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            let sec_websocket_key = parts
                .headers
                .get("sec-websocket-key")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let on_upgrade = match parts.extensions.remove::<hyper::upgrade::OnUpgrade>() {
                Some(on_upgrade) => on_upgrade,
                None => {
                    return error_response(
                        &GatewayError::ClientProtocol("connection does not support upgrades".into()),
                        parts.method.as_str(),
                        &path,
                        Some(client.0.clone()),
                    )
                }
            };

            return ws::handle_upgrade(
                ws::UpgradeRequest {
                    headers,
                    path,
                    raw_path,
                    root_path,
                    query_string,
                    client,
                    server: self.local.clone(),
                    scheme,
                    subprotocols,
                    sec_websocket_key,
                    on_upgrade,
                },
                self.registry.clone(),
                self.dispatcher.clone(),
                self.config.clone(),
                self.application.clone(),
            )
            .await;
        }

        let method = parts.method.as_str().to_uppercase();
        let scope = HttpScope {
            http_version: http_version_string(parts.version),
            method: method.clone(),
            path: path.clone(),
            raw_path,
            root_path,
            scheme,
            query_string,
            headers,
            client: client.clone(),
            server: self.local.clone(),
            asgi_version: "3.0".to_string(),
        };

        let conn_id = self.registry.next_id();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<HttpEvent>();
        let shared = Arc::new(HttpShared {
            conn_id,
            events_tx,
            state: Mutex::new(HttpState {
                responded: false,
                finished: false,
            }),
            created_at: Instant::now(),
            http_timeout: self.config.http_timeout,
        });
        self.registry.register(conn_id, shared);

        let (queue_tx, mut app_ended) = app::create_application(
            conn_id,
            self.registry.clone(),
            self.dispatcher.clone(),
            Scope::Http(scope),
            self.application.clone(),
            self.config.inbound_queue_capacity,
        );

        tokio::spawn(stream_request_body(
            body,
            queue_tx.clone(),
            self.config.request_buffer_size,
            self.registry.clone(),
            conn_id,
        ));

        let log = PendingLog {
            method: method.clone(),
            path: path.clone(),
            host: Some(client.0.clone()),
            status: 0,
        };

        tokio::select! {
            ev = events_rx.recv() => match ev {
                Some(HttpEvent::Start { status, headers: resp_headers }) => {
                    let mut builder = Response::builder().status(
                        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    );
                    let mut has_server = false;
                    for h in &resp_headers {
                        if h.name.eq_ignore_ascii_case(b"server") {
                            has_server = true;
                        }
                        if let (Ok(name), Ok(value)) =
                            (HeaderName::from_bytes(&h.name), HeaderValue::from_bytes(&h.value))
                        {
                            builder = builder.header(name, value);
                        }
                    }
                    if !has_server {
                        builder = builder.header(http::header::SERVER, self.config.server_name.clone());
                    }
                    let body = ResponseBody::streaming(
                        events_rx,
                        app_ended,
                        queue_tx,
                        self.registry.clone(),
                        conn_id,
                        PendingLog { status, ..log },
                    );
                    builder
                        .body(body)
                        .unwrap_or_else(|_| Response::new(ResponseBody::full(Bytes::new())))
                }
                Some(HttpEvent::Violation(msg)) => {
                    tracing::error!(conn_id, error = %msg, "gateway contract violation before response");
                    error_response(&GatewayError::GatewayContract(msg), &log.method, &log.path, log.host)
                }
                Some(HttpEvent::Timeout) => error_response(
                    &GatewayError::Timeout("no response within http_timeout".into()),
                    &log.method,
                    &log.path,
                    log.host,
                ),
                Some(HttpEvent::Backpressure) => error_response(
                    &GatewayError::Backpressure("inbound queue full".into()),
                    &log.method,
                    &log.path,
                    log.host,
                ),
                Some(HttpEvent::Body { .. }) | None => error_response(
                    &GatewayError::Application("application ended without a response".into()),
                    &log.method,
                    &log.path,
                    log.host,
                ),
            },
            _ = app_ended.changed() => {
                let outcome = app_ended.borrow_and_update().clone();
                if let Some(app::AppOutcome::Panicked(msg)) = outcome {
                    tracing::error!(conn_id, error = %msg, "application task panicked before responding");
                    error_response(&GatewayError::Application(msg), &log.method, &log.path, log.host)
                } else {
                    error_response(
                        &GatewayError::Application("application ended without a response".into()),
                        &log.method,
                        &log.path,
                        log.host,
                    )
                }
            }
        }
    }
}

impl Service<Request<Incoming>> for HttpGateway {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.serve(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_headers_drops_underscore_names_and_extracts_root_path() {
        let mut headers = HeaderMap::new();
        headers.insert("x-weird_header", HeaderValue::from_static("x"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers.insert(ROOT_PATH_HEADER, HeaderValue::from_static("%2Fapi"));

        let (clean, root_path) = clean_headers(&headers);
        assert_eq!(clean.len(), 1);
        assert_eq!(clean[0].name, b"accept");
        assert_eq!(root_path.as_deref(), Some("/api"));
    }

    #[test]
    fn error_page_escapes_html() {
        let page = render_error_page(400, "<script>");
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>"));
    }
}
