//! C6 — connection registry & reaper (§4.6), plus the shared
//! [`ConnHandle`] seam C4 and C7 dispatch through (§4.4, §4.7).
//!
//! The registry owns the task handle and the per-connection protocol
//! object outright; the application's `send` callable holds only a
//! connection id and a [`std::sync::Weak`] pointer back here (see
//! [`crate::app`]), so nothing forms a reference cycle back to the task
//! it drives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::message::OutboundMessage;

/// Unique per-connection identity (§3 "Connection ... unique identity").
pub type ConnId = u64;

/// The protocol-specific object each connection registers at scope-build
/// time. C4 routes outbound messages through [`ConnHandle::handle_reply`];
/// C7 drives [`ConnHandle::check_timeouts`] on its sweep cadence.
pub(crate) trait ConnHandle: Send + Sync {
    fn handle_reply(&self, message: OutboundMessage) -> Result<(), GatewayError>;
    fn check_timeouts(&self, now: Instant);
    /// Called by the reaper when the grace period elapses with the task
    /// still alive; lets the handle do protocol-specific cleanup (e.g.
    /// closing the socket) beyond aborting the `JoinHandle`.
    fn on_reaped(&self) {}
    /// Called by a protocol-side producer (e.g. the HTTP body-forwarding
    /// task) when the inbound queue refused a message (§7 "Backpressure").
    /// Default no-op for handles that deal with their own queue directly.
    fn on_backpressure(&self) {}
}

struct ConnEntry {
    connected_at: Instant,
    disconnected_at: Option<Instant>,
    task: Option<JoinHandle<()>>,
    handle: Arc<dyn ConnHandle>,
}

/// Owns every live connection's bookkeeping. One instance per orchestrator.
pub struct Registry {
    entries: Mutex<HashMap<ConnId, ConnEntry>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn next_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a newly scope-built connection. Called by C2/C3 once the
    /// protocol object is ready, before the application task is spawned.
    pub(crate) fn register(&self, id: ConnId, handle: Arc<dyn ConnHandle>) {
        self.entries.lock().unwrap().insert(
            id,
            ConnEntry {
                connected_at: Instant::now(),
                disconnected_at: None,
                task: None,
                handle,
            },
        );
    }

    /// Attaches the spawned application task's handle (C5).
    pub(crate) fn set_task(&self, id: ConnId, task: JoinHandle<()>) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            entry.task = Some(task);
        }
    }

    /// Marks a connection as disconnected; the reaper removes it after
    /// `application_close_timeout` once its task finishes (§4.6).
    pub(crate) fn mark_disconnected(&self, id: ConnId) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            if entry.disconnected_at.is_none() {
                entry.disconnected_at = Some(Instant::now());
            }
        }
    }

    /// C4's single entry point: routes by connection id, dropping silently
    /// when the connection is gone or already disconnected.
    pub(crate) fn dispatch(&self, id: ConnId, message: OutboundMessage) -> Result<(), GatewayError> {
        let handle = {
            let entries = self.entries.lock().unwrap();
            match entries.get(&id) {
                Some(entry) if entry.disconnected_at.is_none() => Some(entry.handle.clone()),
                _ => None,
            }
        };
        match handle {
            Some(handle) => handle.handle_reply(message),
            None => Ok(()),
        }
    }

    /// Routes a backpressure signal from a detached producer task (the
    /// HTTP body forwarder) to the connection's handle.
    pub(crate) fn force_backpressure(&self, id: ConnId) {
        let handle = self.entries.lock().unwrap().get(&id).map(|e| e.handle.clone());
        if let Some(handle) = handle {
            handle.on_backpressure();
        }
    }

    /// C7's sweep: invokes `check_timeouts` on every still-registered
    /// connection, live or recently disconnected.
    pub(crate) fn sweep_timeouts(&self) {
        let now = Instant::now();
        let handles: Vec<Arc<dyn ConnHandle>> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .map(|e| e.handle.clone())
            .collect();
        for handle in handles {
            handle.check_timeouts(now);
        }
    }

    /// C6's sweep, run once per second: cancels orphaned application tasks,
    /// reaps finished ones (logging a backstop warning for any that
    /// panicked outside the per-connection catch-unwind in
    /// [`crate::app::create_application`]), and drops fully-idle registry
    /// entries.
    pub(crate) async fn reap_once(&self, application_close_timeout: Duration) {
        let now = Instant::now();
        let mut to_cancel = Vec::new();
        let mut to_remove = Vec::new();
        let mut to_join = Vec::new();

        {
            let mut entries = self.entries.lock().unwrap();
            for (id, entry) in entries.iter_mut() {
                if entry.task.as_ref().is_some_and(|t| t.is_finished()) {
                    if let Some(task) = entry.task.take() {
                        to_join.push((*id, task));
                    }
                }
                if let Some(disconnected_at) = entry.disconnected_at {
                    let overdue = now.saturating_duration_since(disconnected_at) > application_close_timeout;
                    if overdue {
                        if let Some(task) = &entry.task {
                            if !task.is_finished() {
                                to_cancel.push((*id, entry.handle.clone()));
                            }
                        }
                    }
                    if entry.task.is_none() {
                        to_remove.push(*id);
                    }
                }
            }
            for id in &to_cancel {
                if let Some(entry) = entries.get_mut(&id.0) {
                    if let Some(task) = entry.task.take() {
                        task.abort();
                    }
                }
            }
        }

        for (id, handle) in &to_cancel {
            tracing::warn!(conn_id = id, "application task too long to shut down, cancelling");
            handle.on_reaped();
        }

        // The task already finished by the time we observed it above, so
        // this resolves immediately; it never blocks the sweep. Ordinary
        // application panics are already caught and reported the moment
        // they happen (see `create_application`) — this only catches a
        // panic that somehow unwound past that guard.
        for (id, task) in to_join {
            if let Err(join_err) = task.await {
                if join_err.is_panic() {
                    tracing::error!(conn_id = id, error = %join_err, "application task panicked");
                }
            }
        }

        for id in to_remove {
            self.entries.lock().unwrap().remove(&id);
        }
    }

    /// Cancels and awaits every live application task (used by graceful
    /// shutdown, §4.8 step 5).
    pub(crate) async fn shutdown_all(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut entries = self.entries.lock().unwrap();
            entries.values_mut().filter_map(|e| e.task.take()).collect()
        };
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.entries.lock().unwrap().clear();
    }

    /// Number of live entries; used by tests to assert "no orphan tasks".
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
