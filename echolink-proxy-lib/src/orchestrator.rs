//! The proxy orchestrator: the top-level lifecycle state machine that
//! owns every other component and drives
//! init → open → start → (serve) → shutdown → close → free.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::callsign_filter::CallsignFilter;
use crate::client::ClientWorkerPool;
use crate::config::{self, ProxyConfig};
use crate::context::ProxyContext;
use crate::error::Result;
use crate::listener;
use crate::registration::RegistrationReporter;
use crate::slot_pool::SlotPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Uninitialized,
    Initialized,
    Open,
    Running,
    ShutdownRequested,
    Closed,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("operation requires state {expected:?}, current state is {actual:?}")]
    WrongState { expected: ProxyState, actual: ProxyState },
}

/// Owns every long-lived component of a running proxy server. Construct
/// with [`Proxy::init`], then drive it through the lifecycle in order:
/// [`Proxy::open`], [`Proxy::start`], eventually [`Proxy::shutdown`]
/// and [`Proxy::close`].
pub struct Proxy {
    config: Arc<ProxyConfig>,
    state: ProxyState,
    ctx: Option<Arc<ProxyContext>>,
    workers: Option<Arc<ClientWorkerPool>>,
    listener_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl Proxy {
    /// Validates `config` and constructs the orchestrator. No sockets
    /// are opened and no tasks are spawned yet.
    pub fn init(config: ProxyConfig) -> Result<Proxy> {
        config::validate(&config)?;
        Ok(Proxy {
            config: Arc::new(config),
            state: ProxyState::Initialized,
            ctx: None,
            workers: None,
            listener_task: None,
            shutdown_tx: None,
        })
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    /// Builds the slot pool (opening every outbound socket and
    /// starting every forwarder), compiles the callsign filter, builds
    /// the registration reporter, and binds the client-facing
    /// listener. Does not yet accept connections.
    pub async fn open(&mut self) -> Result<TcpListener> {
        self.require_state(ProxyState::Initialized)?;

        let slots = Arc::new(SlotPool::init(&self.config, Duration::from_millis(self.config.timeouts.connect_ms)).await?);
        let callsign_filter = Arc::new(CallsignFilter::compile(&self.config.callsign_filter)?);
        let registration = RegistrationReporter::init(self.config.registration.clone(), self.config.is_public(), self.config.port);
        let ctx = ProxyContext::new(self.config.clone(), slots, callsign_filter, registration);

        let bind_ip = self.config.bind_address.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let listener = TcpListener::bind((bind_ip.as_str(), self.config.port)).await?;
        info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "listener bound");

        let worker_count = ctx.slots.total();
        let workers = ClientWorkerPool::new(worker_count);

        self.ctx = Some(ctx);
        self.workers = Some(workers);
        self.state = ProxyState::Open;
        Ok(listener)
    }

    /// Spawns every worker/forwarder's running body: the registration
    /// reporter's periodic task and the client-worker pool's session
    /// bodies (the slot forwarders were already started inside
    /// `SlotPool::init`, which follows the same two-phase `init`/`start`
    /// split). Then spawns the listener's accept loop as a background
    /// task.
    pub async fn start(&mut self, listener: TcpListener) -> Result<()> {
        self.require_state(ProxyState::Open)?;
        let ctx = self.ctx.clone().expect("open() populates ctx");
        let workers = self.workers.clone().expect("open() populates workers");

        ctx.registration.start().await;
        workers.start(ctx.clone()).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        self.listener_task = Some(tokio::spawn(listener::run(ctx, workers, listener, shutdown_rx)));

        self.state = ProxyState::Running;
        Ok(())
    }

    /// Waits for the listener task to finish (only happens after
    /// `shutdown()` signals it to stop).
    pub async fn wait_for_shutdown(&mut self) {
        if let Some(task) = self.listener_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "listener task panicked");
            }
        }
    }

    /// Stops accepting new clients, reports `Off` to the directory,
    /// and signals the listener loop to exit. Already-connected
    /// clients keep being served until they disconnect or `close()`
    /// tears everything down.
    pub async fn shutdown(&mut self) {
        if self.state != ProxyState::Running {
            return;
        }
        if let Some(ctx) = &self.ctx {
            ctx.stop_accepting();
            ctx.registration.report_shutdown().await;
        }
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(true);
        }
        self.state = ProxyState::ShutdownRequested;
    }

    /// Drops all clients, stops every forwarder and worker, and
    /// releases every resource opened by `open()`. Safe to call even
    /// if `shutdown()` was skipped (e.g. a test teardown).
    pub async fn close(&mut self) {
        if matches!(self.state, ProxyState::Closed | ProxyState::Uninitialized | ProxyState::Initialized) {
            return;
        }
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(true);
        }
        self.wait_for_shutdown().await;

        // Force-disconnect any client still mid-session so its worker's
        // `process()` loop is unblocked before we wait on the worker
        // pool below; otherwise a connected-but-quiet client would hang
        // teardown indefinitely.
        if let Some(ctx) = &self.ctx {
            ctx.slots.drop_all_clients().await;
        }

        let drain = Duration::from_secs(self.config.timeouts.shutdown_secs);
        if let Some(workers) = self.workers.take() {
            if tokio::time::timeout(drain, workers.stop_all()).await.is_err() {
                warn!(drain_secs = self.config.timeouts.shutdown_secs, "client worker drain timed out during close");
            }
        }
        if let Some(ctx) = self.ctx.take() {
            if tokio::time::timeout(drain, ctx.slots.stop_all()).await.is_err() {
                warn!(drain_secs = self.config.timeouts.shutdown_secs, "slot drain timed out during close");
            }
            ctx.registration.stop().await;
        }
        self.state = ProxyState::Closed;
    }

    fn require_state(&self, expected: ProxyState) -> Result<()> {
        if self.state != expected {
            return Err(crate::error::ProxyError::Fatal(
                LifecycleError::WrongState { expected, actual: self.state }.to_string(),
            ));
        }
        Ok(())
    }
}
