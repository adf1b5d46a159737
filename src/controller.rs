//! Connection lifecycle: discovery, connect, poll, reconnect, shutdown.
//!
//! The controller is the only writer of `ConnectionState`. It owns a single
//! worker thread that polls while `Connected` and runs the reconnect state
//! machine while `Reconnecting`; user-initiated `scan`/`select` run on the
//! caller's thread and only from the idle states.

use crate::instrument::{protocol, InstrumentLink, LinkError};
use crate::poller::{PollExit, Poller, PollerConfig};
use crate::port::{Connector, PortDescriptor, PortScanner, ScanError, TransportError};
use crate::recorder::ReadoutSink;
use crate::signal::StopSignal;
use crate::state::{ConnectionState, LoggingState, StateStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long the idle worker sleeps between state checks.
const IDLE_TICK: Duration = Duration::from_millis(20);

const IDLE_STATES: [ConnectionState; 2] = [ConnectionState::Disconnected, ConnectionState::Scanning];

/// A connection attempt failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Could not open port: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] LinkError),

    #[error("Cannot connect while {0}")]
    Busy(ConnectionState),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("No matching instrument found")]
    NoCandidate,

    #[error("Shutting down")]
    ShuttingDown,
}

/// Bounded exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
            multiplier: 1.5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Substring the `*IDN?` reply must contain.
    pub identity_marker: String,
    pub reconnect: ReconnectPolicy,
    pub poller: PollerConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            identity_marker: "SMU".to_string(),
            reconnect: ReconnectPolicy::default(),
            poller: PollerConfig::default(),
        }
    }
}

struct ControllerInner {
    store: StateStore,
    link: Arc<InstrumentLink>,
    scanner: PortScanner,
    connector: Box<dyn Connector>,
    config: ControllerConfig,
    poller: Poller,
    sink: Option<Arc<dyn ReadoutSink>>,
    last_port: Mutex<Option<String>>,
    /// Process-wide shutdown.
    stop: StopSignal,
    /// Interrupts reconnect backoff (user cancel or shutdown).
    cancel: StopSignal,
}

/// Orchestrates scanner, transport and poller.
pub struct ConnectionController {
    inner: Arc<ControllerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionController {
    pub fn new(
        store: StateStore,
        link: Arc<InstrumentLink>,
        scanner: PortScanner,
        connector: Box<dyn Connector>,
        sink: Option<Arc<dyn ReadoutSink>>,
        config: ControllerConfig,
        stop: StopSignal,
    ) -> Self {
        let poller = Poller::new(
            store.clone(),
            Arc::clone(&link),
            sink.clone(),
            config.poller,
            stop.clone(),
        );
        Self {
            inner: Arc::new(ControllerInner {
                store,
                link,
                scanner,
                connector,
                config,
                poller,
                sink,
                last_port: Mutex::new(None),
                stop,
                cancel: StopSignal::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn link(&self) -> Arc<InstrumentLink> {
        Arc::clone(&self.inner.link)
    }

    pub fn last_port(&self) -> Option<String> {
        self.inner.last_port.lock().clone()
    }

    /// Enter `Scanning` and return the candidates to offer the user.
    pub fn scan(&self) -> Result<Vec<PortDescriptor>, ConnectError> {
        let inner = &self.inner;
        inner
            .store
            .transition(&IDLE_STATES, ConnectionState::Scanning)
            .map_err(ConnectError::Busy)?;
        match inner.scanner.list_candidates() {
            Ok(candidates) => Ok(candidates),
            Err(e) => {
                inner
                    .store
                    .set_connection_failed(ConnectionState::Disconnected, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Connect to `path`. On failure the state returns to `Disconnected`;
    /// there is no automatic retry.
    pub fn select(&self, path: &str) -> Result<u64, ConnectError> {
        let inner = &self.inner;
        if inner.stop.is_triggered() {
            return Err(ConnectError::ShuttingDown);
        }
        inner
            .store
            .transition(&IDLE_STATES, ConnectionState::Connecting)
            .map_err(ConnectError::Busy)?;
        info!(port = path, "connecting");

        match inner.connect_to(path) {
            Ok(_) if inner.stop.is_triggered() => {
                // shutdown() raced this connect; leave nothing open behind it.
                inner.link.detach();
                inner.store.set_connection(ConnectionState::Closed);
                Err(ConnectError::ShuttingDown)
            }
            Ok(epoch) => Ok(epoch),
            Err(e) => {
                inner
                    .store
                    .set_connection_failed(ConnectionState::Disconnected, e.to_string());
                Err(e)
            }
        }
    }

    /// Report link loss for `epoch`. Stale or repeated reports are ignored.
    pub fn on_link_lost(&self, epoch: u64, reason: &str) -> bool {
        self.inner.on_link_lost(epoch, reason)
    }

    /// Abort an in-progress reconnect; the state becomes `Disconnected`.
    pub fn cancel_reconnect(&self) {
        info!("reconnect cancelled by user");
        self.inner.cancel.trigger();
    }

    /// Spawn the worker thread. Calling it again is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("smu-worker".into())
            .spawn(move || inner.run_worker())?;
        *worker = Some(handle);
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.stop.is_triggered()
    }

    /// Stop the worker, close the transport and enter `Closed`.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.stop.trigger();
        inner.cancel.trigger();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        inner.link.detach();
        inner.store.set_connection(ConnectionState::Closed);
        info!("shutdown complete");
    }
}

impl ControllerInner {
    /// Open, identify and start a new epoch on `path`.
    fn connect_to(&self, path: &str) -> Result<u64, ConnectError> {
        let transport = self.connector.open(path)?;
        self.link
            .connect(transport, &self.config.identity_marker)?;
        *self.last_port.lock() = Some(path.to_string());
        let log_file = self.sink.as_ref().and_then(|sink| sink.port_changed(path));
        let epoch = self.store.begin_epoch(path);
        if let Some(target_path) = log_file {
            self.store.set_logging(LoggingState {
                enabled: true,
                target_path: Some(target_path),
            });
        }
        Ok(epoch)
    }

    fn on_link_lost(&self, epoch: u64, reason: &str) -> bool {
        self.cancel.reset();
        if !self.store.mark_link_lost(epoch, reason) {
            return false;
        }
        self.link.detach();
        true
    }

    fn run_worker(&self) {
        debug!("worker started");
        while !self.stop.is_triggered() {
            match self.store.connection() {
                ConnectionState::Connected => {
                    let epoch = self.store.epoch();
                    match self.poller.run(epoch) {
                        PollExit::LinkLost(reason) => {
                            self.on_link_lost(epoch, &reason);
                        }
                        PollExit::Stopped | PollExit::Superseded => {}
                    }
                }
                ConnectionState::Reconnecting => self.reconnect(),
                _ => {
                    self.stop.wait_timeout(IDLE_TICK);
                }
            }
        }
        debug!("worker stopped");
    }

    /// Pick the port for a reconnect attempt: last port if present (or if
    /// enumeration failed), otherwise the best match.
    fn reconnect_target(&self) -> Option<String> {
        let last = self.last_port.lock().clone();
        match self.scanner.list_candidates() {
            Ok(candidates) => {
                if let Some(last) = last.filter(|l| candidates.iter().any(|c| &c.path == l)) {
                    return Some(last);
                }
                candidates.into_iter().find(|c| c.matched).map(|c| c.path)
            }
            Err(e) => {
                debug!(error = %e, "scan failed during reconnect; retrying last port");
                last
            }
        }
    }

    fn attempt_reconnect(&self) -> Result<u64, ConnectError> {
        let path = self.reconnect_target().ok_or(ConnectError::NoCandidate)?;
        let epoch = self.connect_to(&path)?;

        // Output must not come back on unattended.
        let off = self
            .link
            .transaction(|session| session.command(protocol::output(false)));
        if let Err(e) = off {
            warn!(error = %e, "could not force output off after reconnect");
        }
        Ok(epoch)
    }

    fn reconnect(&self) {
        let policy = self.config.reconnect;
        for attempt in 0..policy.max_attempts {
            let delay = policy.delay(attempt);
            debug!(attempt = attempt + 1, ?delay, "waiting before reconnect attempt");
            if self.cancel.wait_timeout(delay) || self.stop.is_triggered() {
                break;
            }
            if self.store.connection() != ConnectionState::Reconnecting {
                return;
            }
            match self.attempt_reconnect() {
                Ok(epoch) => {
                    info!(attempt = attempt + 1, epoch, "reconnected");
                    return;
                }
                Err(e) => warn!(attempt = attempt + 1, error = %e, "reconnect attempt failed"),
            }
        }

        if self.stop.is_triggered() {
            return;
        }
        let reason = if self.cancel.is_triggered() {
            "reconnect cancelled".to_string()
        } else {
            format!("reconnect failed after {} attempts", policy.max_attempts)
        };
        if self.store.connection() == ConnectionState::Reconnecting {
            self.store
                .set_connection_failed(ConnectionState::Disconnected, reason);
        }
    }
}
