//! Background measurement loop for one connection epoch.

use crate::instrument::protocol::{self, Notice};
use crate::instrument::{InstrumentLink, LinkError};
use crate::recorder::ReadoutSink;
use crate::signal::StopSignal;
use crate::state::{ConnectionState, InstrumentReadout, StateStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollerConfig {
    /// Time between the starts of consecutive cycles.
    pub interval: Duration,
    /// Consecutive timeouts/parse failures tolerated before the link is
    /// declared lost.
    pub parse_tolerance: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            parse_tolerance: 3,
        }
    }
}

/// Why [`Poller::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollExit {
    /// Shutdown was requested.
    Stopped,
    /// The store moved on (new epoch or not `Connected`).
    Superseded,
    /// The link is dead; the caller should start reconnecting.
    LinkLost(String),
}

pub struct Poller {
    store: StateStore,
    link: Arc<InstrumentLink>,
    sink: Option<Arc<dyn ReadoutSink>>,
    config: PollerConfig,
    stop: StopSignal,
}

impl Poller {
    pub fn new(
        store: StateStore,
        link: Arc<InstrumentLink>,
        sink: Option<Arc<dyn ReadoutSink>>,
        config: PollerConfig,
        stop: StopSignal,
    ) -> Self {
        Self {
            store,
            link,
            sink,
            config,
            stop,
        }
    }

    /// One cycle: both measurements under a single link acquisition.
    pub fn poll_once(&self, epoch: u64) -> Result<InstrumentReadout, LinkError> {
        self.link.transaction(|session| {
            session.drain_stale()?;
            let voltage = session.measure(protocol::MEASURE_VOLTAGE)?;
            let current = session.measure(protocol::MEASURE_CURRENT)?;
            Ok(InstrumentReadout::new(voltage, current, epoch))
        })
    }

    /// Apply pending device notifications to the store.
    pub fn apply_notices(&self) {
        for notice in self.link.take_notices() {
            match notice {
                Notice::Trip(reason) => self.store.trip(&reason),
                Notice::Other(text) => debug!(%text, "ignoring device notification"),
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        let snap = self.store.snapshot();
        snap.epoch == epoch && snap.connection == ConnectionState::Connected
    }

    /// Poll until shutdown, supersession or link loss.
    pub fn run(&self, epoch: u64) -> PollExit {
        let mut failures: u32 = 0;
        debug!(epoch, "poller started");

        loop {
            if self.stop.is_triggered() {
                return PollExit::Stopped;
            }
            if !self.is_current(epoch) {
                return PollExit::Superseded;
            }

            let started = Instant::now();
            let result = self.poll_once(epoch);
            self.apply_notices();

            match result {
                Ok(readout) => {
                    failures = 0;
                    if !self.store.publish_readout(readout) {
                        return PollExit::Superseded;
                    }
                    if let Some(sink) = &self.sink {
                        if self.store.logging_enabled() {
                            sink.record(&readout);
                        }
                    }
                }
                Err(e) if e.is_link_loss() => return PollExit::LinkLost(e.to_string()),
                Err(e) => {
                    failures += 1;
                    warn!(epoch, failures, error = %e, "poll cycle failed");
                    if failures > self.config.parse_tolerance {
                        return PollExit::LinkLost(format!(
                            "{failures} consecutive failed polls ({e})"
                        ));
                    }
                }
            }

            let pause = self.config.interval.saturating_sub(started.elapsed());
            if self.stop.wait_timeout(pause) {
                return PollExit::Stopped;
            }
        }
    }
}
