//! Shared in-process model of the instrument and the application.
//!
//! One struct behind one `RwLock`. Readers copy out a [`StateSnapshot`];
//! writers go through the narrow methods on [`StateStore`], each of which is a
//! single critical section, so no reader can observe a half-applied update.
//! The store never performs device I/O.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Connection lifecycle, written only by the connection controller.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; entered on user exit.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Scanning => "Scanning",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
            Self::Closed => "Closed",
        };
        f.write_str(s)
    }
}

/// One voltage/current sample. Replaced wholesale, never mutated.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct InstrumentReadout {
    pub voltage: f64,
    pub current: f64,
    #[serde(skip_serializing)]
    pub timestamp: Instant,
    /// Wall-clock time of the sample, for recording.
    pub captured_at: DateTime<Utc>,
    pub epoch: u64,
}

impl InstrumentReadout {
    pub fn new(voltage: f64, current: f64, epoch: u64) -> Self {
        Self {
            voltage,
            current,
            timestamp: Instant::now(),
            captured_at: Utc::now(),
            epoch,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SafetyStatus {
    pub tripped: bool,
    pub reason: Option<String>,
}

/// Source limits last acknowledged by the device.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Limits {
    pub voltage_limit: f64,
    pub current_limit_milliamps: f64,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct LoggingState {
    pub enabled: bool,
    pub target_path: Option<PathBuf>,
}

/// Everything the store holds.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct StateSnapshot {
    pub connection: ConnectionState,
    /// Incremented on every successful connection.
    pub epoch: u64,
    /// Current or last connected port.
    pub port: Option<String>,
    pub readout: Option<InstrumentReadout>,
    pub safety: SafetyStatus,
    pub limits: Limits,
    pub output_enabled: bool,
    pub logging: LoggingState,
    /// Last connection error, cleared on success.
    pub last_error: Option<String>,
    /// Bumped on every write.
    pub revision: u64,
}

/// Handle to the shared state. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    inner: Arc<RwLock<StateSnapshot>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the whole state, taken under one read lock.
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.read().clone()
    }

    pub fn connection(&self) -> ConnectionState {
        self.inner.read().connection
    }

    pub fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }

    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    fn write<R>(&self, f: impl FnOnce(&mut StateSnapshot) -> R) -> R {
        let mut state = self.inner.write();
        let out = f(&mut state);
        state.revision = state.revision.wrapping_add(1);
        out
    }

    pub fn set_connection(&self, next: ConnectionState) {
        self.write(|s| {
            if s.connection != next {
                info!(from = %s.connection, to = %next, "connection state changed");
                s.connection = next;
            }
        });
    }

    /// Move to `next` only from one of `allowed`; returns the current state
    /// otherwise. Check and update happen under one lock.
    pub fn transition(
        &self,
        allowed: &[ConnectionState],
        next: ConnectionState,
    ) -> Result<(), ConnectionState> {
        let mut state = self.inner.write();
        if !allowed.contains(&state.connection) {
            return Err(state.connection);
        }
        if state.connection != next {
            info!(from = %state.connection, to = %next, "connection state changed");
            state.connection = next;
        }
        state.revision = state.revision.wrapping_add(1);
        Ok(())
    }

    pub fn logging_enabled(&self) -> bool {
        self.inner.read().logging.enabled
    }

    /// Record a failed connection attempt.
    pub fn set_connection_failed(&self, next: ConnectionState, error: impl Into<String>) {
        let error = error.into();
        self.write(|s| {
            info!(from = %s.connection, to = %next, %error, "connection attempt failed");
            s.connection = next;
            s.last_error = Some(error);
        });
    }

    /// Start a new epoch on `port`: instrument fields reset, state `Connected`.
    pub fn begin_epoch(&self, port: &str) -> u64 {
        self.write(|s| {
            s.epoch += 1;
            s.port = Some(port.to_string());
            s.readout = None;
            s.safety = SafetyStatus::default();
            s.limits = Limits::default();
            s.output_enabled = false;
            s.last_error = None;
            s.connection = ConnectionState::Connected;
            info!(port, epoch = s.epoch, "connected");
            s.epoch
        })
    }

    /// Move `Connected` to `Reconnecting` for the given epoch.
    ///
    /// Returns false (and changes nothing) for a stale epoch or when the
    /// store is not `Connected`, so duplicate loss signals are harmless.
    pub fn mark_link_lost(&self, epoch: u64, reason: &str) -> bool {
        self.write(|s| {
            if s.epoch != epoch || s.connection != ConnectionState::Connected {
                debug!(epoch, current = s.epoch, state = %s.connection, "ignoring stale link-loss signal");
                return false;
            }
            warn!(epoch, reason, "link lost");
            s.connection = ConnectionState::Reconnecting;
            s.readout = None;
            s.output_enabled = false;
            s.safety = SafetyStatus {
                tripped: true,
                reason: Some(format!("link lost: {reason}")),
            };
            true
        })
    }

    /// Publish a readout. Rejected unless it belongs to the current
    /// epoch and the link is `Connected`.
    pub fn publish_readout(&self, readout: InstrumentReadout) -> bool {
        let mut state = self.inner.write();
        if readout.epoch != state.epoch || state.connection != ConnectionState::Connected {
            return false;
        }
        state.readout = Some(readout);
        state.revision = state.revision.wrapping_add(1);
        true
    }

    /// Latch an over-current trip. Output is off on the device once tripped.
    pub fn trip(&self, reason: &str) {
        self.write(|s| {
            warn!(reason, "over-current trip");
            s.safety = SafetyStatus {
                tripped: true,
                reason: Some(reason.to_string()),
            };
            s.output_enabled = false;
        });
    }

    pub fn clear_trip(&self) {
        self.write(|s| s.safety = SafetyStatus::default());
    }

    pub fn set_voltage_limit(&self, volts: f64) {
        self.write(|s| s.limits.voltage_limit = volts);
    }

    pub fn set_current_limit(&self, milliamps: f64) {
        self.write(|s| s.limits.current_limit_milliamps = milliamps);
    }

    pub fn set_output(&self, enabled: bool) {
        self.write(|s| s.output_enabled = enabled);
    }

    pub fn set_logging(&self, logging: LoggingState) {
        self.write(|s| s.logging = logging);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn connected_store() -> (StateStore, u64) {
        let store = StateStore::new();
        let epoch = store.begin_epoch("/dev/ttyACM0");
        (store, epoch)
    }

    #[test]
    fn test_default_snapshot() {
        let snap = StateStore::new().snapshot();
        assert_eq!(snap.connection, ConnectionState::Disconnected);
        assert_eq!(snap.epoch, 0);
        assert!(snap.readout.is_none());
        assert_eq!(snap.limits, Limits::default());
    }

    #[test]
    fn test_readout_requires_current_epoch() {
        let (store, epoch) = connected_store();
        assert!(store.publish_readout(InstrumentReadout::new(1.0, 0.1, epoch)));
        assert!(!store.publish_readout(InstrumentReadout::new(2.0, 0.2, epoch + 1)));
        assert_eq!(store.snapshot().readout.unwrap().voltage, 1.0);
    }

    #[test]
    fn test_link_loss_clears_readout_and_rejects_stale() {
        let (store, epoch) = connected_store();
        store.publish_readout(InstrumentReadout::new(1.0, 0.1, epoch));

        assert!(store.mark_link_lost(epoch, "unplugged"));
        let snap = store.snapshot();
        assert_eq!(snap.connection, ConnectionState::Reconnecting);
        assert!(snap.readout.is_none());
        assert!(snap.safety.tripped);
        assert_eq!(snap.safety.reason.as_deref(), Some("link lost: unplugged"));

        assert!(!store.publish_readout(InstrumentReadout::new(3.0, 0.3, epoch)));
        assert!(!store.mark_link_lost(epoch, "again"));
    }

    #[test]
    fn test_new_epoch_resets_instrument_fields_but_not_logging() {
        let (store, epoch) = connected_store();
        store.set_voltage_limit(5.0);
        store.set_output(true);
        store.trip("OVERCURRENT");
        store.set_logging(LoggingState {
            enabled: true,
            target_path: Some(PathBuf::from("/tmp/x.csv")),
        });
        store.mark_link_lost(epoch, "gone");

        let next = store.begin_epoch("/dev/ttyACM1");
        let snap = store.snapshot();
        assert_eq!(next, epoch + 1);
        assert_eq!(snap.limits, Limits::default());
        assert!(!snap.output_enabled);
        assert_eq!(snap.safety, SafetyStatus::default());
        assert!(snap.logging.enabled);
        assert_eq!(snap.port.as_deref(), Some("/dev/ttyACM1"));
    }

    #[test]
    fn test_trip_forces_output_off() {
        let (store, _) = connected_store();
        store.set_output(true);
        store.trip("OVERCURRENT");
        let snap = store.snapshot();
        assert!(snap.safety.tripped);
        assert!(!snap.output_enabled);

        store.clear_trip();
        assert!(!store.snapshot().safety.tripped);
    }

    #[test]
    fn test_transition_is_guarded() {
        let store = StateStore::new();
        let idle = [ConnectionState::Disconnected, ConnectionState::Scanning];
        assert!(store.transition(&idle, ConnectionState::Connecting).is_ok());
        assert_eq!(
            store.transition(&idle, ConnectionState::Connecting),
            Err(ConnectionState::Connecting)
        );
    }

    #[test]
    fn test_revision_increases_on_writes() {
        let store = StateStore::new();
        let before = store.revision();
        store.set_connection(ConnectionState::Scanning);
        store.set_output(false);
        assert!(store.revision() >= before + 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let (store, epoch) = connected_store();
        store.publish_readout(InstrumentReadout::new(1.25, 0.5, epoch));
        let json = serde_json::to_value(store.snapshot()).unwrap();
        assert_eq!(json["connection"], "connected");
        assert_eq!(json["readout"]["voltage"], 1.25);
        assert!(json["readout"].get("timestamp").is_none());
    }
}
