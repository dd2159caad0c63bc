//! C5 — application runner (§4.5).
//!
//! Bridges a connection's [`Scope`] and message queue to user code written
//! against the gateway contract: `(scope, receive, send)`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::message::{InboundMessage, OutboundMessage};
use crate::registry::{ConnId, Registry};
use crate::scope::Scope;

/// The consumer half of a connection's gateway input queue: `receive()` in
/// the gateway contract. One per connection; dropped (and the queue GC'd)
/// when the application task ends.
pub struct Receiver {
    rx: mpsc::Receiver<InboundMessage>,
}

impl Receiver {
    /// Awaits the next inbound message in arrival order (§5 ordering
    /// guarantees). Returns `None` only once the producer side has been
    /// dropped, which the protocol state machines never do while the
    /// connection is registered.
    pub async fn receive(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

/// The producer half of the same queue, held by C2/C3 to enqueue inbound
/// messages (`http.request`, `websocket.receive`, ...). Bounded: per §7
/// "Backpressure", a full queue is a hard error for the connection, never
/// something a producer blocks waiting on — callers use `try_send` and
/// force-close the connection on `Full` rather than awaiting capacity.
pub(crate) type QueueProducer = mpsc::Sender<InboundMessage>;

/// How the application task ended, observed by C2/C3 racing
/// [`AppEndedRx`] against their own reply-event stream (§4.2 "If the
/// application task raises").
#[derive(Debug, Clone)]
pub(crate) enum AppOutcome {
    /// The task's future returned normally.
    Ended,
    /// The task panicked; the message is the panic payload, when it could
    /// be downcast to a string.
    Panicked(String),
}

/// Fires once, when the application task finishes. A `watch` channel
/// rather than a `oneshot` so both the pre-response wait in C2/C3 and a
/// still-streaming response body can each hold their own receiver and
/// check it without fighting over ownership.
pub(crate) type AppEndedRx = watch::Receiver<Option<AppOutcome>>;

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "application task panicked".to_string()
    }
}

/// `send()` in the gateway contract. Cheap to clone; every clone targets
/// the same connection.
#[derive(Clone)]
pub struct Sender {
    conn_id: ConnId,
    registry: std::sync::Weak<Registry>,
    dispatcher: Dispatcher,
}

impl Sender {
    pub(crate) fn new(conn_id: ConnId, registry: Arc<Registry>, dispatcher: Dispatcher) -> Self {
        Self {
            conn_id,
            registry: Arc::downgrade(&registry),
            dispatcher,
        }
    }

    /// Hands `message` to the reply dispatcher (C4). Returns
    /// `Err(GatewayError::GatewayContract(..))` when the application
    /// violated the outbound message shape; the application is expected to
    /// propagate that error and terminate (§7).
    pub async fn send(&self, message: OutboundMessage) -> Result<(), GatewayError> {
        if self.registry.upgrade().is_none() {
            // Server shutting down; nothing left to route to.
            return Ok(());
        }
        self.dispatcher.handle_reply(self.conn_id, message)
    }
}

/// Everything the gateway contract hands to the application for one
/// connection.
pub struct AppContext {
    pub scope: Scope,
    pub receive: Receiver,
    pub send: Sender,
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// User code implements this to act as the application behind the gateway.
///
/// A plain `async fn(AppContext)` (or closure returning one) satisfies this
/// automatically via the blanket impl below — implementing the trait by
/// hand is only needed for applications with their own state.
pub trait Application: Send + Sync + 'static {
    fn call(&self, ctx: AppContext) -> BoxFuture;
}

impl<F, Fut> Application for F
where
    F: Fn(AppContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: AppContext) -> BoxFuture {
        Box::pin(self(ctx))
    }
}

/// Creates the gateway input queue, spawns the application task, and
/// stores its `JoinHandle` in the registry (§4.5). Returns the producer
/// side of the queue for the protocol state machine to enqueue into.
///
/// The scope handed to the application already carries its
/// `asgi_version` stamp — C2/C3 set it when they build the scope, before
/// this function ever sees it.
pub(crate) fn create_application(
    conn_id: ConnId,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    scope: Scope,
    application: Arc<dyn Application>,
    queue_capacity: usize,
) -> (QueueProducer, AppEndedRx) {
    let (tx, rx) = mpsc::channel(queue_capacity);
    let receiver = Receiver { rx };
    let send = Sender::new(conn_id, registry.clone(), dispatcher);
    let ctx = AppContext {
        scope,
        receive: receiver,
        send,
    };

    let (ended_tx, ended_rx) = watch::channel(None);

    let task: JoinHandle<()> = tokio::spawn(async move {
        let outcome = match AssertUnwindSafe(application.call(ctx)).catch_unwind().await {
            Ok(()) => AppOutcome::Ended,
            Err(payload) => AppOutcome::Panicked(panic_message(payload.as_ref())),
        };
        let _ = ended_tx.send(Some(outcome));
    });
    registry.set_task(conn_id, task);

    (tx, ended_rx)
}
