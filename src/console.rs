//! Line-oriented console: port selection, command entry, status display.
//!
//! Reads from any `BufRead` and writes to any `Write` so it can be driven
//! from tests. It never writes to the state store; everything goes through
//! the controller or the command interpreter.

use crate::command::{CommandInterpreter, CommandOutcome, DisplayEvent, QueryData};
use crate::controller::ConnectionController;
use crate::port::PortDescriptor;
use crate::signal::StopSignal;
use crate::state::{ConnectionState, StateSnapshot, StateStore};
use std::io::{self, BufRead, Write};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// One line summarising the state.
pub fn format_status(snap: &StateSnapshot) -> String {
    let mut line = match &snap.port {
        Some(port) => format!("[{} {}]", snap.connection, port),
        None => format!("[{}]", snap.connection),
    };
    match &snap.readout {
        Some(r) => line.push_str(&format!(
            " V={:.4} V  I={:.3} mA",
            r.voltage,
            r.current * 1000.0
        )),
        None => line.push_str(" V=--  I=--"),
    }
    line.push_str(&format!(
        "  OUT={}  LOG={}",
        if snap.output_enabled { "on" } else { "off" },
        if snap.logging.enabled { "on" } else { "off" }
    ));
    if snap.safety.tripped {
        line.push_str(&format!(
            "  TRIPPED ({})",
            snap.safety.reason.as_deref().unwrap_or("unknown")
        ));
    }
    line
}

pub fn render_outcome(outcome: &CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Acknowledged(msg) => msg.clone(),
        CommandOutcome::Rejected(reason) => format!("Error: {reason}"),
        CommandOutcome::QueryResult(QueryData::Limits(limits)) => format!(
            "Voltage limit: {} V, current limit: {} mA",
            limits.voltage_limit, limits.current_limit_milliamps
        ),
        CommandOutcome::QueryResult(QueryData::Status(snap)) => format_status(snap),
        CommandOutcome::QueryResult(QueryData::Help(text)) => (*text).to_string(),
    }
}

/// Messages worth showing when the state moves from `prev` to `next`.
pub fn describe_change(prev: &StateSnapshot, next: &StateSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    if prev.connection != next.connection {
        let mut msg = format!("* {}", next.connection);
        if next.connection == ConnectionState::Connected {
            if let Some(port) = &next.port {
                msg.push_str(&format!(" to {port}"));
            }
        }
        if next.connection == ConnectionState::Disconnected {
            if let Some(err) = &next.last_error {
                msg.push_str(&format!(": {err}"));
            }
        }
        lines.push(msg);
    }
    if !prev.safety.tripped && next.safety.tripped {
        lines.push(format!(
            "* TRIPPED: {}",
            next.safety.reason.as_deref().unwrap_or("unknown")
        ));
    }
    if prev.safety.tripped && !next.safety.tripped && next.connection == ConnectionState::Connected {
        lines.push("* Trip cleared".to_string());
    }
    lines
}

/// Print state changes to stdout until `stop` fires.
pub fn spawn_watcher(store: StateStore, stop: StopSignal) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("smu-watcher".into())
        .spawn(move || {
            let mut prev = store.snapshot();
            while !stop.wait_timeout(WATCH_INTERVAL) {
                if store.revision() == prev.revision {
                    continue;
                }
                let next = store.snapshot();
                for line in describe_change(&prev, &next) {
                    println!("{line}");
                }
                prev = next;
            }
        })
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub struct Console<R, W> {
    controller: Arc<ConnectionController>,
    interpreter: CommandInterpreter,
    display: Receiver<DisplayEvent>,
    input: R,
    out: W,
    stop: StopSignal,
}

impl<R: BufRead, W: Write> Console<R, W> {
    pub fn new(
        controller: Arc<ConnectionController>,
        interpreter: CommandInterpreter,
        display: Receiver<DisplayEvent>,
        input: R,
        out: W,
        stop: StopSignal,
    ) -> Self {
        Self {
            controller,
            interpreter,
            display,
            input,
            out,
            stop,
        }
    }

    /// Run until `exit`, end of input, or the stop signal.
    pub fn run(&mut self) -> io::Result<()> {
        writeln!(self.out, "smu-ctl ready. Type 'help' for commands.")?;

        while !self.stop.is_triggered() {
            self.drain_display()?;

            match self.controller.store().connection() {
                ConnectionState::Disconnected | ConnectionState::Scanning => {
                    if self.choose_port()? == Flow::Quit {
                        self.stop.trigger();
                        break;
                    }
                    continue;
                }
                ConnectionState::Closed => break,
                _ => {}
            }

            write!(self.out, "> ")?;
            self.out.flush()?;
            let Some(line) = self.read_line()? else {
                self.stop.trigger();
                break;
            };
            if line.is_empty() {
                continue;
            }

            if line.eq_ignore_ascii_case("cancel") {
                if self.controller.store().connection() == ConnectionState::Reconnecting {
                    self.controller.cancel_reconnect();
                    writeln!(self.out, "Reconnect cancelled")?;
                } else {
                    writeln!(self.out, "Nothing to cancel")?;
                }
                continue;
            }

            let outcome = self.interpreter.execute(&line);
            writeln!(self.out, "{}", render_outcome(&outcome))?;
        }

        self.out.flush()
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = String::new();
        if self.input.read_line(&mut buf)? == 0 {
            return Ok(None);
        }
        Ok(Some(buf.trim().to_string()))
    }

    fn drain_display(&mut self) -> io::Result<()> {
        while let Ok(event) = self.display.try_recv() {
            match event {
                // ANSI clear screen + cursor home
                DisplayEvent::Clear => write!(self.out, "\x1b[2J\x1b[H")?,
            }
        }
        Ok(())
    }

    fn print_candidates(&mut self, candidates: &[PortDescriptor]) -> io::Result<()> {
        if candidates.is_empty() {
            writeln!(self.out, "No serial ports found.")?;
            return Ok(());
        }
        writeln!(self.out, "Available ports:")?;
        for (i, c) in candidates.iter().enumerate() {
            writeln!(self.out, "  [{}] {}", i + 1, c.label)?;
        }
        Ok(())
    }

    /// Offer the scanned ports and connect to the chosen one.
    fn choose_port(&mut self) -> io::Result<Flow> {
        let candidates = match self.controller.scan() {
            Ok(c) => c,
            Err(e) => {
                writeln!(self.out, "Port scan failed: {e}")?;
                Vec::new()
            }
        };
        self.print_candidates(&candidates)?;

        write!(self.out, "Select port number or path (r = rescan, q = quit): ")?;
        self.out.flush()?;
        let Some(choice) = self.read_line()? else {
            return Ok(Flow::Quit);
        };

        let path = match choice.to_ascii_lowercase().as_str() {
            "" | "r" => return Ok(Flow::Continue),
            "q" | "quit" | "exit" => return Ok(Flow::Quit),
            _ => match choice.parse::<usize>() {
                Ok(n) if (1..=candidates.len()).contains(&n) => candidates[n - 1].path.clone(),
                Ok(_) => {
                    writeln!(self.out, "No port with that number.")?;
                    return Ok(Flow::Continue);
                }
                Err(_) => choice,
            },
        };

        writeln!(self.out, "Connecting to {path}...")?;
        match self.controller.select(&path) {
            Ok(_) => writeln!(self.out, "{}", format_status(&self.controller.store().snapshot()))?,
            Err(e) => writeln!(self.out, "Connection failed: {e}")?,
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InstrumentReadout, Limits, SafetyStatus};

    #[test]
    fn test_format_status() {
        let mut snap = StateSnapshot {
            connection: ConnectionState::Connected,
            port: Some("/dev/ttyACM0".into()),
            readout: Some(InstrumentReadout::new(3.3, 0.0125, 1)),
            output_enabled: true,
            ..Default::default()
        };
        assert_eq!(
            format_status(&snap),
            "[Connected /dev/ttyACM0] V=3.3000 V  I=12.500 mA  OUT=on  LOG=off"
        );

        snap.readout = None;
        snap.safety = SafetyStatus {
            tripped: true,
            reason: Some("OVERCURRENT".into()),
        };
        assert!(format_status(&snap).ends_with("TRIPPED (OVERCURRENT)"));
    }

    #[test]
    fn test_render_limits() {
        let outcome = CommandOutcome::QueryResult(QueryData::Limits(Limits {
            voltage_limit: 5.0,
            current_limit_milliamps: 100.0,
        }));
        assert_eq!(
            render_outcome(&outcome),
            "Voltage limit: 5 V, current limit: 100 mA"
        );
        assert_eq!(
            render_outcome(&CommandOutcome::Rejected("nope".into())),
            "Error: nope"
        );
    }

    #[test]
    fn test_describe_change() {
        let prev = StateSnapshot::default();
        let next = StateSnapshot {
            connection: ConnectionState::Connected,
            port: Some("COM3".into()),
            ..Default::default()
        };
        assert_eq!(describe_change(&prev, &next), vec!["* Connected to COM3"]);

        let lost = StateSnapshot {
            connection: ConnectionState::Reconnecting,
            safety: SafetyStatus {
                tripped: true,
                reason: Some("link lost: gone".into()),
            },
            ..next.clone()
        };
        assert_eq!(
            describe_change(&next, &lost),
            vec!["* Reconnecting", "* TRIPPED: link lost: gone"]
        );
        assert!(describe_change(&lost, &lost).is_empty());
    }
}
