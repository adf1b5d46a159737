//! Console tests: scripted stdin against a simulated instrument.

mod common;

use common::{Rig, PORT};
use smu_ctl::command::CommandInterpreter;
use smu_ctl::console::Console;
use smu_ctl::state::ConnectionState;
use std::io::Cursor;
use std::sync::{mpsc, Arc};

fn run_script(rig: &Rig, script: &str) -> String {
    let (tx, rx) = mpsc::channel();
    let interpreter = CommandInterpreter::new(
        rig.store.clone(),
        Arc::clone(&rig.link),
        None,
        Default::default(),
        rig.stop.clone(),
    )
    .with_display(tx);

    let mut out = Vec::new();
    {
        let mut console = Console::new(
            Arc::clone(&rig.controller),
            interpreter,
            rx,
            Cursor::new(script.to_string()),
            &mut out,
            rig.stop.clone(),
        );
        console.run().unwrap();
    }
    String::from_utf8(out).unwrap()
}

#[test]
fn test_select_then_commands() {
    let rig = Rig::new();

    let out = run_script(&rig, "1\nvlimit 5\nmode?\nexit\n");

    assert!(out.contains("Available ports:"), "{out}");
    assert!(out.contains(&format!("[1] {PORT}")), "{out}");
    assert!(out.contains(&format!("Connecting to {PORT}...")), "{out}");
    assert!(out.contains("Voltage limit set to 5 V"), "{out}");
    assert!(out.contains("Voltage limit: 5 V, current limit: 0 mA"), "{out}");
    assert!(rig.stop.is_triggered());
    assert_eq!(rig.sim.setpoints().0, 5.0);
}

#[test]
fn test_quit_at_port_prompt() {
    let rig = Rig::new();

    let out = run_script(&rig, "q\n");

    assert!(out.contains("Select port"), "{out}");
    assert!(rig.stop.is_triggered());
    assert!(rig.connector.open_attempts().is_empty());
}

#[test]
fn test_end_of_input_stops() {
    let rig = Rig::new();
    rig.connect();

    let out = run_script(&rig, "status\n");

    assert!(out.contains(&format!("[Connected {PORT}]")), "{out}");
    assert!(rig.stop.is_triggered());
}

#[test]
fn test_failed_selection_returns_to_prompt() {
    let rig = Rig::new();

    let out = run_script(&rig, "/dev/ttyUSB7\n9\nq\n");

    assert!(out.contains("Connection failed"), "{out}");
    assert!(out.contains("No port with that number."), "{out}");
    assert_eq!(rig.store.connection(), ConnectionState::Scanning);
}

#[test]
fn test_clear_writes_escape_sequence() {
    let rig = Rig::new();
    rig.connect();

    let out = run_script(&rig, "clear\nhelp\n");

    assert!(out.contains("\x1b[2J\x1b[H"));
    assert!(out.contains("vlimit <V>"));
}

#[test]
fn test_cancel_outside_reconnect() {
    let rig = Rig::new();
    rig.connect();

    let out = run_script(&rig, "cancel\nexit\n");
    assert!(out.contains("Nothing to cancel"), "{out}");
}
