//! Minimal command-line server wiring a sample application against the
//! gateway contract: GET requests get `200 OK`, everything else is
//! echoed back as a WebSocket once upgraded.
//!
//! Option surface mirrors a conventional `--bind`/`--port`/`--proxy-headers`
//! CLI for this kind of server.

use std::sync::Arc;

use clap::Parser;
use netgate::app::AppContext;
use netgate::config::Config;
use netgate::listener::Endpoint;
use netgate::message::{InboundMessage, OutboundMessage};
use netgate::scope::Scope;
use netgate::server::Server;

#[derive(Parser)]
#[command(about = "Run a demo HTTP/WebSocket gateway server")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    #[arg(long)]
    proxy_headers: bool,

    #[arg(long, default_value_t = 120)]
    http_timeout: u64,

    #[arg(long, default_value_t = 20)]
    ping_interval: u64,

    #[arg(long, default_value_t = 30)]
    ping_timeout: u64,
}

async fn echo_application(mut ctx: AppContext) {
    match &ctx.scope {
        Scope::Http(http) => {
            let status = if http.path == "/" { 200 } else { 404 };
            let body = if status == 200 { b"OK".to_vec() } else { b"not found".to_vec() };
            if ctx
                .send
                .send(OutboundMessage::HttpResponseStart { status, headers: vec![] })
                .await
                .is_err()
            {
                return;
            }
            let _ = ctx
                .send
                .send(OutboundMessage::HttpResponseBody { body, more_body: false })
                .await;
        }
        Scope::WebSocket(ws) => {
            let subprotocol = ws.subprotocols.first().cloned();
            if ctx
                .send
                .send(OutboundMessage::WebSocketAccept { subprotocol })
                .await
                .is_err()
            {
                return;
            }
            loop {
                match ctx.receive.receive().await {
                    Some(InboundMessage::WebSocketReceive(data)) => {
                        if ctx.send.send(OutboundMessage::WebSocketSend(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(InboundMessage::WebSocketDisconnect { .. }) | None => break,
                    _ => {}
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut config = Config::default()
        .with_http_timeout(std::time::Duration::from_secs(args.http_timeout));
    config.ping_interval = std::time::Duration::from_secs(args.ping_interval);
    config.ping_timeout = std::time::Duration::from_secs(args.ping_timeout);
    if args.proxy_headers {
        config = config.with_proxy_headers();
    }

    let endpoint = Endpoint::tcp(args.bind.clone(), args.port);
    let server = Server::bind(config, Arc::new(echo_application), &[endpoint]).await?;

    tracing::info!(bind = %args.bind, port = args.port, "netgate demo server starting");

    server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    Ok(())
}
