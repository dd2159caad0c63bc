//! C8 — orchestrator (§4.8).
//!
//! Binds listeners, runs one accept loop per listener, and drives the C6
//! reaper and C7 timeout sweep as background tasks alongside graceful
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::sync::watch;

use crate::app::Application;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::http::HttpGateway;
use crate::listener::{Accepted, BoundListener, Endpoint};
use crate::registry::Registry;

/// Owns every listener and background task for one running server. Built
/// with [`Server::bind`], run with [`Server::serve`].
pub struct Server {
    config: Arc<Config>,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    application: Arc<dyn Application>,
    listeners: Vec<BoundListener>,
}

impl Server {
    /// Binds every endpoint up front so startup fails fast on a bad address
    /// or missing permission rather than after accepting the first
    /// connection. Fatal if `endpoints` is empty (§4.8 step 1).
    pub async fn bind(
        config: Config,
        application: Arc<dyn Application>,
        endpoints: &[Endpoint],
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        if endpoints.is_empty() {
            return Err(GatewayError::Fatal(
                "at least one listen endpoint is required".into(),
            ));
        }

        let mut listeners = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let bound = BoundListener::bind(endpoint)
                .await
                .map_err(|e| GatewayError::Fatal(format!("failed to bind listener: {e}")))?;
            tracing::info!(addr = %bound.local_addr_display(), "listening");
            listeners.push(bound);
        }

        let registry = Registry::new();
        let dispatcher = Dispatcher::new(registry.clone());

        Ok(Self {
            config: Arc::new(config),
            registry,
            dispatcher,
            application,
            listeners,
        })
    }

    /// The bound address of each listener, in the order passed to
    /// [`Server::bind`]. Useful for tests and for logging the ephemeral
    /// port chosen when binding to port `0`.
    pub fn local_addrs(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.local_addr_display()).collect()
    }

    /// Runs every accept loop plus the reaper and timeout sweep until
    /// `shutdown` resolves, then cancels and awaits all outstanding
    /// application tasks (§4.8 step 5).
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reaper = tokio::spawn(run_reaper(
            self.registry.clone(),
            self.config.reaper_interval,
            self.config.application_close_timeout,
            shutdown_rx.clone(),
        ));
        let sweeper = tokio::spawn(run_timeout_sweep(
            self.registry.clone(),
            self.config.timeout_sweep_interval,
            shutdown_rx.clone(),
        ));

        let mut accept_loops = Vec::with_capacity(self.listeners.len());
        for listener in self.listeners {
            accept_loops.push(tokio::spawn(run_accept_loop(
                listener,
                self.registry.clone(),
                self.dispatcher.clone(),
                self.config.clone(),
                self.application.clone(),
                shutdown_rx.clone(),
            )));
        }

        shutdown.await;
        tracing::info!("shutdown requested, draining connections");
        let _ = shutdown_tx.send(true);

        for handle in accept_loops {
            let _ = handle.await;
        }
        let _ = reaper.await;
        let _ = sweeper.await;

        self.registry.shutdown_all().await;
    }
}

async fn run_accept_loop(
    listener: BoundListener,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    config: Arc<Config>,
    application: Arc<dyn Application>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(accepted) => {
                        let registry = registry.clone();
                        let dispatcher = dispatcher.clone();
                        let config = config.clone();
                        let application = application.clone();
                        tokio::spawn(async move {
                            handle_connection(accepted, registry, dispatcher, config, application).await;
                        });
                    }
                    Err(err) if crate::listener::is_connection_error(&err) => {
                        tracing::debug!(error = %err, "accept failed for a gone peer, retrying");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    accepted: Accepted,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    config: Arc<Config>,
    application: Arc<dyn Application>,
) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let result = match accepted {
        Accepted::Tcp(stream, peer, local) => {
            let gateway = HttpGateway::new(registry, dispatcher, config, application, peer, local);
            builder
                .serve_connection_with_upgrades(TokioIo::new(stream), gateway)
                .await
        }
        #[cfg(unix)]
        Accepted::Unix(stream, peer, local) => {
            let gateway = HttpGateway::new(registry, dispatcher, config, application, peer, local);
            builder
                .serve_connection_with_upgrades(TokioIo::new(stream), gateway)
                .await
        }
    };
    if let Err(err) = result {
        tracing::debug!(error = %err, "connection ended with an error");
    }
}

async fn run_reaper(
    registry: Arc<Registry>,
    interval: Duration,
    application_close_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                registry.reap_once(application_close_timeout).await;
            }
        }
    }
}

async fn run_timeout_sweep(registry: Arc<Registry>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                registry.sweep_timeouts();
            }
        }
    }
}
