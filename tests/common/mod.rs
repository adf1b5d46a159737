//! Shared test utilities for smu-ctl integration tests.
//!
//! This module provides:
//! - A `Rig` wiring a controller to a simulated instrument
//! - A connected command interpreter without a worker thread
//! - An in-memory readout sink
//! - Polling helpers for asynchronous state changes

#![allow(dead_code)]

use parking_lot::Mutex;
use smu_ctl::command::{CommandInterpreter, CommandLimits};
use smu_ctl::controller::{ConnectionController, ControllerConfig, ReconnectPolicy};
use smu_ctl::instrument::InstrumentLink;
use smu_ctl::poller::PollerConfig;
use smu_ctl::port::{
    Connector, DeviceFilter, LineTransport, MockConnector, MockSerialPort, PortScanner,
    SimulatedSmu, StaticEnumerator, Transport, TransportError, VID_RASPBERRY_PI,
};
use smu_ctl::recorder::{ReadoutSink, RecorderError};
use smu_ctl::signal::StopSignal;
use smu_ctl::state::{InstrumentReadout, StateSnapshot, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const PORT: &str = "/dev/ttyACM0";
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(50);

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Wait until the store satisfies `cond`; panics with the last snapshot otherwise.
pub fn wait_for_state(store: &StateStore, cond: impl Fn(&StateSnapshot) -> bool) -> StateSnapshot {
    let mut last = store.snapshot();
    let ok = wait_for(Duration::from_secs(3), || {
        last = store.snapshot();
        cond(&last)
    });
    assert!(ok, "state never reached the expected condition: {last:?}");
    last
}

/// Lets a test keep a handle on the connector it hands to the controller.
pub struct SharedConnector(pub Arc<MockConnector>);

impl Connector for SharedConnector {
    fn open(&self, path: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.0.open(path)
    }
}

/// Readout sink that keeps everything in memory.
#[derive(Default)]
pub struct MemorySink {
    pub enabled: Mutex<bool>,
    pub readouts: Mutex<Vec<InstrumentReadout>>,
}

impl ReadoutSink for MemorySink {
    fn set_enabled(
        &self,
        enabled: bool,
        _port: Option<&str>,
    ) -> Result<Option<PathBuf>, RecorderError> {
        *self.enabled.lock() = enabled;
        Ok(enabled.then(|| PathBuf::from("memory")))
    }

    fn record(&self, readout: &InstrumentReadout) {
        self.readouts.lock().push(*readout);
    }
}

/// Fast timings so reconnect tests finish quickly.
pub fn fast_config(reconnect: ReconnectPolicy) -> ControllerConfig {
    ControllerConfig {
        identity_marker: "SMU".to_string(),
        reconnect,
        poller: PollerConfig {
            interval: Duration::from_millis(10),
            parse_tolerance: 3,
        },
    }
}

pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(50),
        multiplier: 1.5,
    }
}

/// Controller, interpreter and simulator wired together.
pub struct Rig {
    pub sim: SimulatedSmu,
    pub store: StateStore,
    pub link: Arc<InstrumentLink>,
    pub connector: Arc<MockConnector>,
    pub enumerator: StaticEnumerator,
    pub controller: Arc<ConnectionController>,
    pub interpreter: CommandInterpreter,
    pub stop: StopSignal,
}

impl Rig {
    pub fn new() -> Self {
        Self::build(SimulatedSmu::new(), fast_policy(), None)
    }

    pub fn with_policy(policy: ReconnectPolicy) -> Self {
        Self::build(SimulatedSmu::new(), policy, None)
    }

    pub fn with_sink(sink: Arc<dyn ReadoutSink>) -> Self {
        Self::build(SimulatedSmu::new(), fast_policy(), Some(sink))
    }

    pub fn build(
        sim: SimulatedSmu,
        policy: ReconnectPolicy,
        sink: Option<Arc<dyn ReadoutSink>>,
    ) -> Self {
        let store = StateStore::new();
        let stop = StopSignal::new();
        let link = Arc::new(InstrumentLink::new(REPLY_TIMEOUT));

        let connector = Arc::new(MockConnector::new());
        connector.attach(PORT, sim.clone());

        let enumerator = StaticEnumerator::new();
        enumerator.add_usb(PORT, VID_RASPBERRY_PI, 0x000A, Some("Pico SMU"));
        let scanner = PortScanner::new(Box::new(enumerator.clone()), DeviceFilter::default());

        let controller = Arc::new(ConnectionController::new(
            store.clone(),
            Arc::clone(&link),
            scanner,
            Box::new(SharedConnector(Arc::clone(&connector))),
            sink.clone(),
            fast_config(policy),
            stop.clone(),
        ));
        controller.start().expect("worker thread starts");

        let interpreter = CommandInterpreter::new(
            store.clone(),
            Arc::clone(&link),
            sink,
            CommandLimits::default(),
            stop.clone(),
        );

        Self {
            sim,
            store,
            link,
            connector,
            enumerator,
            controller,
            interpreter,
            stop,
        }
    }

    /// Select the simulated port and wait for the first readout.
    pub fn connect(&self) -> u64 {
        let epoch = self.controller.select(PORT).expect("simulated port connects");
        wait_for_state(&self.store, |s| s.readout.is_some());
        epoch
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.controller.shutdown();
    }
}

/// Interpreter on a link that is already identified, with no poller running.
///
/// Every line the simulator receives therefore comes from the interpreter.
pub fn connected_interpreter(sim: &SimulatedSmu) -> (CommandInterpreter, StateStore) {
    let (interpreter, store, _port) = connected_interpreter_with_port(sim);
    (interpreter, store)
}

/// Like [`connected_interpreter`], also returning a handle on the byte port
/// so a test can inject input the simulator never sent.
pub fn connected_interpreter_with_port(
    sim: &SimulatedSmu,
) -> (CommandInterpreter, StateStore, MockSerialPort) {
    let store = StateStore::new();
    let link = Arc::new(InstrumentLink::new(REPLY_TIMEOUT));
    let port = sim.port(PORT);
    link.connect(Box::new(LineTransport::new(port.clone(), "\n")), "SMU")
        .expect("simulator identifies as an SMU");
    store.begin_epoch(PORT);
    let interpreter = CommandInterpreter::new(
        store.clone(),
        link,
        None,
        CommandLimits::default(),
        StopSignal::new(),
    );
    (interpreter, store, port)
}
