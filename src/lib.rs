//! smu-ctl library
//!
//! Host-side control of a serial-attached Source Measure Unit: port
//! discovery, line-framed transport, continuous polling into a shared state
//! store, supervised reconnect, and a validated user command set.
//!
//! # Modules
//!
//! - `config`: TOML configuration with environment overrides
//! - `port`: serial transport, port scanning and test doubles
//! - `instrument`: wire protocol and the request/response link
//! - `state`: the shared state store
//! - `poller`: periodic measurement loop
//! - `controller`: connection lifecycle and reconnect supervision
//! - `command`: user command parsing and dispatch
//! - `recorder`: CSV measurement recording
//! - `console`: line-oriented user interface
//! - `error`: top-level application error

pub mod command;
pub mod config;
pub mod console;
pub mod controller;
pub mod error;
pub mod instrument;
pub mod poller;
pub mod port;
pub mod recorder;
pub mod signal;
pub mod state;

pub use command::{Command, CommandError, CommandInterpreter, CommandLimits, CommandOutcome};
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult};
pub use controller::{ConnectError, ConnectionController, ControllerConfig, ReconnectPolicy};
pub use error::AppError;
pub use instrument::{InstrumentLink, LinkError};
pub use poller::{PollExit, Poller, PollerConfig};
pub use port::{PortConfiguration, PortScanner, SerialConnector, TransportError};
pub use recorder::{CsvRecorder, ReadoutSink};
pub use signal::StopSignal;
pub use state::{ConnectionState, InstrumentReadout, StateSnapshot, StateStore};
