//! `netgate` terminates HTTP/1.1 and WebSocket connections and bridges each
//! one to an async application written against a small gateway contract:
//! `(scope, receive, send)`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use netgate::app::AppContext;
//! use netgate::config::Config;
//! use netgate::listener::Endpoint;
//! use netgate::message::OutboundMessage;
//! use netgate::scope::Scope;
//! use netgate::server::Server;
//!
//! async fn echo(mut ctx: AppContext) {
//!     match ctx.scope {
//!         Scope::Http(_) => {
//!             let _ = ctx
//!                 .send
//!                 .send(OutboundMessage::HttpResponseStart {
//!                     status: 200,
//!                     headers: vec![],
//!                 })
//!                 .await;
//!             let _ = ctx
//!                 .send
//!                 .send(OutboundMessage::HttpResponseBody {
//!                     body: b"ok".to_vec(),
//!                     more_body: false,
//!                 })
//!                 .await;
//!         }
//!         Scope::WebSocket(_) => {
//!             let _ = ctx
//!                 .send
//!                 .send(OutboundMessage::WebSocketAccept { subprotocol: None })
//!                 .await;
//!             while let Some(msg) = ctx.receive.receive().await {
//!                 if let netgate::message::InboundMessage::WebSocketReceive(data) = msg {
//!                     let _ = ctx.send.send(OutboundMessage::WebSocketSend(data)).await;
//!                 }
//!             }
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::bind(Config::default(), Arc::new(echo), &[Endpoint::tcp("0.0.0.0", 8000)])
//!         .await
//!         .unwrap();
//!     server.serve(std::future::pending()).await;
//! }
//! ```

pub mod access;
pub mod app;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forwarded;
pub mod http;
pub mod listener;
pub mod message;
pub mod registry;
pub mod scope;
pub mod server;
pub mod ws;

pub use app::{AppContext, Application, Receiver, Sender};
pub use config::Config;
pub use error::GatewayError;
pub use message::{InboundMessage, OutboundMessage, WebSocketData};
pub use scope::{HttpScope, Scope, ScopeHeader, WebSocketScope};
pub use server::Server;
