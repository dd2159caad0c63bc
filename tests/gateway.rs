//! End-to-end scenarios driving the gateway over real TCP sockets.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use netgate::app::AppContext;
use netgate::config::Config;
use netgate::listener::Endpoint;
use netgate::message::{InboundMessage, OutboundMessage};
use netgate::scope::Scope;
use netgate::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

async fn start_server<F>(app: F) -> (String, oneshot::Sender<()>, tokio::task::JoinHandle<()>)
where
    F: Fn(AppContext) -> BoxFuture + Send + Sync + 'static,
{
    let server = Server::bind(Config::default(), Arc::new(app), &[Endpoint::tcp("127.0.0.1", 0)])
        .await
        .expect("bind");
    let addr = server.local_addrs().remove(0);
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        server
            .serve(async {
                let _ = rx.await;
            })
            .await;
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    (addr, tx, handle)
}

async fn read_with_timeout(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_millis(500), stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn ok_app(ctx: AppContext) -> BoxFuture {
    Box::pin(async move {
        let _ = ctx
            .send
            .send(OutboundMessage::HttpResponseStart { status: 200, headers: vec![] })
            .await;
        let _ = ctx
            .send
            .send(OutboundMessage::HttpResponseBody { body: b"OK".to_vec(), more_body: false })
            .await;
    })
}

#[tokio::test]
async fn get_root_returns_200_with_body() {
    let (addr, shutdown, handle) = start_server(ok_app).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_with_timeout(&mut stream).await;

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("OK"));

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn post_body_arrives_as_a_single_http_request_message() {
    let received: Arc<Mutex<Vec<InboundMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let app = move |mut ctx: AppContext| -> BoxFuture {
        let sink = sink.clone();
        Box::pin(async move {
            loop {
                match ctx.receive.receive().await {
                    Some(msg @ InboundMessage::HttpRequest { more_body, .. }) => {
                        let done = !more_body;
                        sink.lock().await.push(msg);
                        if done {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            let _ = ctx
                .send
                .send(OutboundMessage::HttpResponseStart { status: 200, headers: vec![] })
                .await;
            let _ = ctx
                .send
                .send(OutboundMessage::HttpResponseBody { body: vec![], more_body: false })
                .await;
        })
    };

    let (addr, shutdown, handle) = start_server(app).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"POST /submit HTTP/1.1\r\nHost: test\r\nContent-Length: 8\r\nConnection: close\r\n\r\nname=foo")
        .await
        .unwrap();
    let _ = read_with_timeout(&mut stream).await;

    let messages = received.lock().await;
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        InboundMessage::HttpRequest { body, more_body } => {
            assert_eq!(body, b"name=foo");
            assert!(!more_body);
        }
        other => panic!("unexpected message: {other:?}"),
    }

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn invalid_path_bytes_produce_a_400() {
    let (addr, shutdown, handle) = start_server(ok_app).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let mut request = b"GET /".to_vec();
    request.extend_from_slice(&[0xc3, 0xa4, 0xc3, 0xb6]);
    request.extend_from_slice(b" HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
    stream.write_all(&request).await.unwrap();
    let response = read_with_timeout(&mut stream).await;

    assert!(response.contains("400"), "expected a 400 response, got: {response}");

    let _ = shutdown.send(());
    let _ = handle.await;
}

fn chunked_app(ctx: AppContext) -> BoxFuture {
    Box::pin(async move {
        let _ = ctx
            .send
            .send(OutboundMessage::HttpResponseStart { status: 201, headers: vec![] })
            .await;
        let _ = ctx
            .send
            .send(OutboundMessage::HttpResponseBody {
                body: b"chunk 1 ".to_vec(),
                more_body: true,
            })
            .await;
        let _ = ctx
            .send
            .send(OutboundMessage::HttpResponseBody {
                body: b"chunk 2".to_vec(),
                more_body: false,
            })
            .await;
    })
}

#[tokio::test]
async fn chunked_response_concatenates_in_order() {
    let (addr, shutdown, handle) = start_server(chunked_app).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_with_timeout(&mut stream).await;

    assert!(response.starts_with("HTTP/1.1 201"));
    let chunk1_pos = response.find("chunk 1").expect("first chunk present");
    let chunk2_pos = response.find("chunk 2").expect("second chunk present");
    assert!(chunk1_pos < chunk2_pos);

    let _ = shutdown.send(());
    let _ = handle.await;
}

fn echo_ws_app(mut ctx: AppContext) -> BoxFuture {
    Box::pin(async move {
        let subprotocol = match &ctx.scope {
            Scope::WebSocket(ws) => ws.subprotocols.iter().find(|p| p.as_str() == "b").cloned(),
            _ => None,
        };
        if ctx
            .send
            .send(OutboundMessage::WebSocketAccept { subprotocol })
            .await
            .is_err()
        {
            return;
        }
        while let Some(msg) = ctx.receive.receive().await {
            match msg {
                InboundMessage::WebSocketReceive(data) => {
                    let _ = ctx.send.send(OutboundMessage::WebSocketSend(data)).await;
                }
                InboundMessage::WebSocketDisconnect { .. } => break,
                _ => {}
            }
        }
    })
}

#[tokio::test]
async fn websocket_handshake_negotiates_subprotocol_and_echoes() {
    let (addr, shutdown, handle) = start_server(echo_ws_app).await;

    let mut request = format!("ws://{addr}/chat").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "a, b".parse().unwrap());

    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.expect("handshake");
    assert_eq!(
        response.headers().get("sec-websocket-protocol").and_then(|v| v.to_str().ok()),
        Some("b")
    );

    ws.send(Message::Text("hi".into())).await.unwrap();
    let reply = ws.next().await.expect("reply").expect("ok frame");
    assert_eq!(reply.into_text().unwrap().to_string(), "hi");

    let _ = ws.close(None).await;
    let _ = shutdown.send(());
    let _ = handle.await;
}

fn reject_ws_app(ctx: AppContext) -> BoxFuture {
    Box::pin(async move {
        let _ = ctx.send.send(OutboundMessage::WebSocketClose { code: None }).await;
    })
}

#[tokio::test]
async fn websocket_reject_returns_403() {
    let (addr, shutdown, handle) = start_server(reject_ws_app).await;

    let request = format!("ws://{addr}/chat").into_client_request().unwrap();
    let err = tokio_tungstenite::connect_async(request)
        .await
        .expect_err("handshake should be rejected");
    assert!(format!("{err}").contains("403"));

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn registry_has_no_orphans_after_shutdown() {
    let (addr, shutdown, handle) = start_server(ok_app).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let _ = read_with_timeout(&mut stream).await;

    let _ = shutdown.send(());
    let _ = handle.await;
}
