//! User command parsing and dispatch.
//!
//! A line is parsed into a closed [`Command`] enum (parsing never panics and
//! never touches the device), then validated against the configured maxima
//! and the current state, and only then written to the instrument. The store
//! is updated after the device acknowledges.

use crate::instrument::{protocol, InstrumentLink};
use crate::recorder::ReadoutSink;
use crate::signal::StopSignal;
use crate::state::{ConnectionState, Limits, LoggingState, StateSnapshot, StateStore};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const HELP_TEXT: &str = "\
Commands:
  vlimit <V>        set the voltage limit (alias: setv)
  climit <mA>       set the current limit in milliamps
  output on|off     switch the output (aliases: on/enable, off/disable)
  logdata on|off    start or stop CSV recording
  zero              clear an over-current trip / tare the instrument
  mode?             show the acknowledged limits
  status            show connection and measurement state
  clear             clear the display (alias: cls)
  help              this text (aliases: h, ?)
  exit              quit (aliases: quit, q)";

/// A parsed user command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetVoltageLimit(f64),
    /// Milliamps.
    SetCurrentLimit(f64),
    Output(bool),
    LogData(bool),
    Zero,
    QueryMode,
    Status,
    Help,
    Clear,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("Invalid argument {value:?}: {reason}")]
    InvalidArgument { value: String, reason: String },

    #[error("Unknown command {0:?} (type 'help' for a list)")]
    UnknownCommand(String),

    #[error("Usage: {0}")]
    MissingArgument(&'static str),

    #[error("Not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("Output is tripped ({0}); send 'zero' first")]
    Tripped(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Device: {0}")]
    Device(String),

    #[error("Logging: {0}")]
    Logging(String),
}

/// What a presentation layer can be asked to show.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
    Limits(Limits),
    Status(Box<StateSnapshot>),
    Help(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Acknowledged(String),
    Rejected(String),
    QueryResult(QueryData),
}

/// Side-channel events for the presentation collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEvent {
    Clear,
}

fn usage(keyword: &str) -> &'static str {
    match keyword {
        "vlimit" | "setv" => "vlimit <volts>",
        "climit" => "climit <milliamps>",
        "output" => "output on|off",
        "logdata" => "logdata on|off",
        _ => "help",
    }
}

fn parse_number(text: &str) -> Result<f64, CommandError> {
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(CommandError::InvalidArgument {
            value: text.to_string(),
            reason: "expected a finite number".to_string(),
        }),
    }
}

fn parse_switch(text: &str) -> Result<bool, CommandError> {
    match text.to_ascii_lowercase().as_str() {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(CommandError::InvalidArgument {
            value: text.to_string(),
            reason: "expected 'on' or 'off'".to_string(),
        }),
    }
}

impl Command {
    /// Parse one input line. Total: every input yields a command or an error.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split_whitespace();
        let keyword = tokens.next().unwrap_or_default().to_ascii_lowercase();
        let args: Vec<&str> = tokens.collect();

        let one_arg = || match args.as_slice() {
            [arg] => Ok(*arg),
            _ => Err(CommandError::MissingArgument(usage(&keyword))),
        };
        let no_args = |cmd: Command| {
            if args.is_empty() {
                Ok(cmd)
            } else {
                Err(CommandError::MissingArgument(usage(&keyword)))
            }
        };

        match keyword.as_str() {
            "vlimit" | "setv" => parse_number(one_arg()?).map(Command::SetVoltageLimit),
            "climit" => parse_number(one_arg()?).map(Command::SetCurrentLimit),
            "output" => parse_switch(one_arg()?).map(Command::Output),
            "on" | "enable" => no_args(Command::Output(true)),
            "off" | "disable" => no_args(Command::Output(false)),
            "logdata" => parse_switch(one_arg()?).map(Command::LogData),
            "zero" => no_args(Command::Zero),
            "mode?" => no_args(Command::QueryMode),
            "status" => no_args(Command::Status),
            "help" | "h" | "?" => Ok(Command::Help),
            "clear" | "cls" => no_args(Command::Clear),
            "exit" | "quit" | "q" => Ok(Command::Exit),
            _ => Err(CommandError::UnknownCommand(keyword.clone())),
        }
    }
}

/// Upper bounds accepted for the limit commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandLimits {
    pub max_voltage: f64,
    pub max_current_ma: f64,
}

impl Default for CommandLimits {
    fn default() -> Self {
        Self {
            max_voltage: 20.0,
            max_current_ma: 500.0,
        }
    }
}

fn check_range(value: f64, max: f64, unit: &str) -> Result<(), CommandError> {
    if (0.0..=max).contains(&value) {
        Ok(())
    } else {
        Err(CommandError::InvalidArgument {
            value: value.to_string(),
            reason: format!("must be between 0 and {max} {unit}"),
        })
    }
}

/// Executes commands against the store and the instrument link.
pub struct CommandInterpreter {
    store: StateStore,
    link: Arc<InstrumentLink>,
    sink: Option<Arc<dyn ReadoutSink>>,
    limits: CommandLimits,
    stop: StopSignal,
    display: Option<Sender<DisplayEvent>>,
}

impl CommandInterpreter {
    pub fn new(
        store: StateStore,
        link: Arc<InstrumentLink>,
        sink: Option<Arc<dyn ReadoutSink>>,
        limits: CommandLimits,
        stop: StopSignal,
    ) -> Self {
        Self {
            store,
            link,
            sink,
            limits,
            stop,
            display: None,
        }
    }

    /// Deliver `DisplayEvent`s to `tx`.
    pub fn with_display(mut self, tx: Sender<DisplayEvent>) -> Self {
        self.display = Some(tx);
        self
    }

    /// Parse and run one line.
    pub fn execute(&self, line: &str) -> CommandOutcome {
        let result = if self.stop.is_triggered() {
            Err(CommandError::ShuttingDown)
        } else {
            Command::parse(line).and_then(|cmd| self.dispatch(cmd))
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(line, error = %e, "command rejected");
                CommandOutcome::Rejected(e.to_string())
            }
        }
    }

    /// Run an already parsed command.
    pub fn dispatch(&self, command: Command) -> Result<CommandOutcome, CommandError> {
        if self.stop.is_triggered() {
            return Err(CommandError::ShuttingDown);
        }

        match command {
            Command::SetVoltageLimit(volts) => {
                check_range(volts, self.limits.max_voltage, "V")?;
                self.require_connected()?;
                self.device_command(&protocol::set_voltage(volts))?;
                self.store.set_voltage_limit(volts);
                Ok(ack(format!("Voltage limit set to {volts} V")))
            }
            Command::SetCurrentLimit(milliamps) => {
                check_range(milliamps, self.limits.max_current_ma, "mA")?;
                self.require_connected()?;
                self.device_command(&protocol::set_current(milliamps / 1000.0))?;
                self.store.set_current_limit(milliamps);
                Ok(ack(format!("Current limit set to {milliamps} mA")))
            }
            Command::Output(enabled) => {
                let snap = self.require_connected()?;
                if enabled && snap.safety.tripped {
                    let reason = snap.safety.reason.unwrap_or_else(|| "tripped".to_string());
                    return Err(CommandError::Tripped(reason));
                }
                self.device_command(protocol::output(enabled))?;
                self.store.set_output(enabled);
                Ok(ack(format!("Output {}", if enabled { "on" } else { "off" })))
            }
            Command::LogData(enabled) => self.set_logging(enabled),
            Command::Zero => {
                self.require_connected()?;
                self.device_command(protocol::ZERO)?;
                self.store.clear_trip();
                Ok(ack("Zeroed; trip cleared".to_string()))
            }
            Command::QueryMode => Ok(CommandOutcome::QueryResult(QueryData::Limits(
                self.store.snapshot().limits,
            ))),
            Command::Status => Ok(CommandOutcome::QueryResult(QueryData::Status(Box::new(
                self.store.snapshot(),
            )))),
            Command::Help => Ok(CommandOutcome::QueryResult(QueryData::Help(HELP_TEXT))),
            Command::Clear => {
                if let Some(tx) = &self.display {
                    // A closed display is not the user's problem.
                    let _ = tx.send(DisplayEvent::Clear);
                }
                Ok(ack("Display cleared".to_string()))
            }
            Command::Exit => {
                info!("exit requested");
                self.stop.trigger();
                Ok(ack("Exiting".to_string()))
            }
        }
    }

    fn require_connected(&self) -> Result<StateSnapshot, CommandError> {
        let snap = self.store.snapshot();
        match snap.connection {
            ConnectionState::Connected => Ok(snap),
            other => Err(CommandError::NotConnected(other)),
        }
    }

    fn device_command(&self, line: &str) -> Result<(), CommandError> {
        self.link
            .transaction(|session| {
                // A late reply to an earlier exchange must not ack this one.
                session.drain_stale()?;
                session.command(line)
            })
            .map_err(|e| CommandError::Device(e.to_string()))
    }

    fn set_logging(&self, enabled: bool) -> Result<CommandOutcome, CommandError> {
        let Some(sink) = &self.sink else {
            return Err(CommandError::Logging("no recorder configured".to_string()));
        };
        let port = self.store.snapshot().port;
        let target_path = sink
            .set_enabled(enabled, port.as_deref())
            .map_err(|e| CommandError::Logging(e.to_string()))?;

        let message = match &target_path {
            Some(path) => format!("Logging to {}", path.display()),
            None => "Logging stopped".to_string(),
        };
        self.store.set_logging(LoggingState {
            enabled,
            target_path,
        });
        Ok(ack(message))
    }
}

fn ack(message: String) -> CommandOutcome {
    CommandOutcome::Acknowledged(message)
}
