//! C4 — reply dispatcher (§4.4).
//!
//! A single, cheaply-cloneable front door the application's `send`
//! callable (see [`crate::app::Sender`]) and the connection registry share.
//! All the actual per-protocol validation lives behind
//! [`crate::registry::ConnHandle`], implemented by [`crate::http`] and
//! [`crate::ws`]; this type only owns the routing/drop-silently policy.

use std::sync::Arc;

use crate::error::GatewayError;
use crate::message::OutboundMessage;
use crate::registry::{ConnId, Registry};

/// Bound to a single [`Registry`]; `handle_reply` is the one operation it
/// exposes, matching §4.4's "exposes a single async operation" contract.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub(crate) fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Drops silently if the connection is gone or already disconnected;
    /// otherwise routes `message` into the connection's protocol state
    /// machine. This call never blocks on I/O — routing just hands the
    /// message to the per-connection channel.
    pub fn handle_reply(&self, id: ConnId, message: OutboundMessage) -> Result<(), GatewayError> {
        self.registry.dispatch(id, message)
    }
}
