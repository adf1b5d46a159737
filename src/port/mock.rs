//! Mock serial hardware for tests.
//!
//! `MockSerialPort` is a byte-level stand-in for a real port: reads come from
//! a queue, writes are logged, and an optional responder turns every complete
//! written line into reply lines. `SimulatedSmu` is such a responder modelling
//! the instrument's wire protocol, with knobs for the failure modes the
//! connection layer has to survive (unplug, silence, garbage, trips).
//! `MockConnector` and `StaticEnumerator` let the controller run against it.

use super::error::{ScanError, TransportError};
use super::line::LineTransport;
use super::scanner::PortEnumerator;
use super::traits::{Connector, SerialPortAdapter, Transport};
use parking_lot::Mutex;
use serialport::{SerialPortInfo, SerialPortType, UsbPortInfo};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

/// Longest a mock read will "block" when nothing is queued.
const EMPTY_READ_NAP: Duration = Duration::from_millis(2);

#[derive(Default)]
struct MockPortState {
    /// Bytes to be returned by read operations.
    read_queue: VecDeque<u8>,
    /// Every write, as passed to `write_bytes`.
    write_log: Vec<Vec<u8>>,
    /// Written bytes not yet terminated by a newline.
    partial_line: Vec<u8>,
    /// Whether the next write should time out.
    should_timeout: bool,
    timeout: Duration,
    responder: Option<Responder>,
}

/// Mock serial port implementation for testing.
///
/// Clones share state, so a test can keep one handle for inspection while
/// the code under test owns another.
///
/// # Example
/// ```
/// use smu_ctl::port::{MockSerialPort, SerialPortAdapter};
///
/// let mut port = MockSerialPort::new("MOCK0");
/// port.enqueue_read(b"OK\n");
///
/// let mut buffer = [0u8; 8];
/// let n = port.read_bytes(&mut buffer).unwrap();
/// assert_eq!(&buffer[..n], b"OK\n");
///
/// port.write_bytes(b":OUTP OFF\n").unwrap();
/// assert_eq!(port.written_lines(), vec![":OUTP OFF".to_string()]);
/// ```
#[derive(Clone)]
pub struct MockSerialPort {
    name: String,
    state: Arc<Mutex<MockPortState>>,
    /// Shared "cable" flag; false behaves like an unplugged device.
    cable: Arc<AtomicBool>,
}

impl MockSerialPort {
    /// Create a new mock serial port with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_cable(name, Arc::new(AtomicBool::new(true)))
    }

    fn with_cable(name: impl Into<String>, cable: Arc<AtomicBool>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockPortState {
                timeout: Duration::from_millis(200),
                ..Default::default()
            })),
            cable,
        }
    }

    /// Create a port whose written lines are answered by `responder`.
    pub fn with_responder<F>(name: impl Into<String>, responder: F) -> Self
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        let port = Self::new(name);
        port.state.lock().responder = Some(Box::new(responder));
        port
    }

    /// Enqueue bytes to be returned by subsequent read operations.
    pub fn enqueue_read(&mut self, data: &[u8]) {
        self.state.lock().read_queue.extend(data);
    }

    /// Get a copy of all data written to the port.
    pub fn get_write_log(&self) -> Vec<Vec<u8>> {
        self.state.lock().write_log.clone()
    }

    /// Written data split into lines, terminators removed.
    pub fn written_lines(&self) -> Vec<String> {
        let state = self.state.lock();
        let all: Vec<u8> = state.write_log.concat();
        String::from_utf8_lossy(&all)
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .collect()
    }

    /// Make the next write time out.
    pub fn set_should_timeout(&mut self, should_timeout: bool) {
        self.state.lock().should_timeout = should_timeout;
    }

    /// Simulate pulling the cable.
    pub fn unplug(&self) {
        self.cable.store(false, Ordering::SeqCst);
    }

    /// Get the number of bytes available to read.
    pub fn available_bytes(&self) -> usize {
        self.state.lock().read_queue.len()
    }

    fn check_cable(&self) -> Result<(), TransportError> {
        if self.cable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "device unplugged",
            )))
        }
    }
}

impl SerialPortAdapter for MockSerialPort {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.check_cable()?;
        let mut state = self.state.lock();

        if state.should_timeout {
            state.should_timeout = false;
            return Err(TransportError::timeout(state.timeout));
        }

        state.write_log.push(data.to_vec());
        state.partial_line.extend_from_slice(data);

        while let Some(pos) = memchr::memchr(b'\n', &state.partial_line) {
            let raw: Vec<u8> = state.partial_line.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            let replies = match state.responder.as_mut() {
                Some(respond) => respond(&line),
                None => Vec::new(),
            };
            for reply in replies {
                state.read_queue.extend(reply.as_bytes());
                state.read_queue.push_back(b'\n');
            }
        }

        Ok(data.len())
    }

    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        self.check_cable()?;
        let mut state = self.state.lock();

        let mut bytes_read = 0;
        for byte in buffer.iter_mut() {
            match state.read_queue.pop_front() {
                Some(queued) => {
                    *byte = queued;
                    bytes_read += 1;
                }
                None => break,
            }
        }

        if bytes_read == 0 {
            // Stand in for a blocking read that hit its timeout.
            let nap = state.timeout.min(EMPTY_READ_NAP);
            drop(state);
            std::thread::sleep(nap);
        }

        Ok(bytes_read)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.state.lock().timeout = timeout;
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<(), TransportError> {
        self.check_cable()?;
        self.state.lock().read_queue.clear();
        Ok(())
    }
}

impl std::fmt::Debug for MockSerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSerialPort")
            .field("name", &self.name)
            .field("plugged", &self.cable.load(Ordering::SeqCst))
            .finish()
    }
}

// ========== Simulated instrument ==========

#[derive(Debug)]
struct SimState {
    identity: String,
    voltage: f64,
    current: f64,
    output: bool,
    voltage_setpoint: f64,
    current_setpoint: f64,
    tripped: bool,
    notices: Vec<String>,
    silent: bool,
    malformed: bool,
    reject_reason: Option<String>,
    received: Vec<String>,
}

/// A scripted SMU that answers the wire protocol.
///
/// Clones share state. Every port produced by [`SimulatedSmu::port`] shares
/// the simulator's cable, so [`SimulatedSmu::unplug`] kills all of them.
#[derive(Clone, Debug)]
pub struct SimulatedSmu {
    state: Arc<Mutex<SimState>>,
    cable: Arc<AtomicBool>,
}

impl Default for SimulatedSmu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSmu {
    pub fn new() -> Self {
        Self::with_identity("Pico SMU v1.2")
    }

    /// Simulator that answers `*IDN?` with `identity`.
    pub fn with_identity(identity: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                identity: identity.into(),
                voltage: 0.0,
                current: 0.0,
                output: false,
                voltage_setpoint: 0.0,
                current_setpoint: 0.0,
                tripped: false,
                notices: Vec::new(),
                silent: false,
                malformed: false,
                reject_reason: None,
                received: Vec::new(),
            })),
            cable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A fresh byte-level port wired to this simulator.
    pub fn port(&self, name: impl Into<String>) -> MockSerialPort {
        let port = MockSerialPort::with_cable(name, Arc::clone(&self.cable));
        let sim = self.clone();
        port.state.lock().responder = Some(Box::new(move |line| sim.respond(line)));
        port
    }

    /// Set the values returned by the measurement queries.
    pub fn set_measurement(&self, voltage: f64, current: f64) {
        let mut st = self.state.lock();
        st.voltage = voltage;
        st.current = current;
    }

    /// Raise an over-current trip; the notice is sent ahead of the next reply.
    pub fn trip(&self, reason: &str) {
        let mut st = self.state.lock();
        st.tripped = true;
        st.output = false;
        st.notices.push(format!("!TRIP {reason}"));
    }

    /// Stop answering anything (every exchange will time out).
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Answer measurement queries with text that is not a number.
    pub fn set_malformed(&self, malformed: bool) {
        self.state.lock().malformed = malformed;
    }

    /// Answer every set-command with `ERR <reason>`.
    pub fn reject_settings(&self, reason: Option<&str>) {
        self.state.lock().reject_reason = reason.map(str::to_string);
    }

    pub fn unplug(&self) {
        self.cable.store(false, Ordering::SeqCst);
    }

    pub fn replug(&self) {
        self.cable.store(true, Ordering::SeqCst);
    }

    pub fn is_plugged(&self) -> bool {
        self.cable.load(Ordering::SeqCst)
    }

    pub fn output_enabled(&self) -> bool {
        self.state.lock().output
    }

    pub fn is_tripped(&self) -> bool {
        self.state.lock().tripped
    }

    /// `(voltage, current)` setpoints last accepted by the simulator.
    pub fn setpoints(&self) -> (f64, f64) {
        let st = self.state.lock();
        (st.voltage_setpoint, st.current_setpoint)
    }

    /// Every line received, in order.
    pub fn received(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    fn respond(&self, line: &str) -> Vec<String> {
        let mut st = self.state.lock();
        st.received.push(line.to_string());
        if st.silent {
            return Vec::new();
        }

        let mut out: Vec<String> = st.notices.drain(..).collect();
        let (head, arg) = match line.split_once(' ') {
            Some((h, a)) => (h.to_ascii_uppercase(), Some(a.trim().to_string())),
            None => (line.to_ascii_uppercase(), None),
        };

        let reply = match (head.as_str(), arg) {
            ("*IDN?", None) => st.identity.clone(),
            (":MEAS:VOLT?", None) if st.malformed => "V=??".to_string(),
            (":MEAS:CURR?", None) if st.malformed => "overflow".to_string(),
            (":MEAS:VOLT?", None) => format!("{:.6}", st.voltage),
            (":MEAS:CURR?", None) => format!("{:.6}", st.current),
            (":SOUR:VOLT" | ":SOUR:CURR" | ":OUTP" | ":SYST:ZERO", _)
                if st.reject_reason.is_some() =>
            {
                format!("ERR {}", st.reject_reason.clone().unwrap_or_default())
            }
            (":SOUR:VOLT", Some(v)) => match v.parse::<f64>() {
                Ok(v) => {
                    st.voltage_setpoint = v;
                    "OK".to_string()
                }
                Err(_) => "ERR bad number".to_string(),
            },
            (":SOUR:CURR", Some(a)) => match a.parse::<f64>() {
                Ok(a) => {
                    st.current_setpoint = a;
                    "OK".to_string()
                }
                Err(_) => "ERR bad number".to_string(),
            },
            (":OUTP", Some(state)) if state.eq_ignore_ascii_case("ON") => {
                if st.tripped {
                    "ERR tripped".to_string()
                } else {
                    st.output = true;
                    "OK".to_string()
                }
            }
            (":OUTP", Some(state)) if state.eq_ignore_ascii_case("OFF") => {
                st.output = false;
                "OK".to_string()
            }
            (":SYST:ZERO", None) => {
                st.tripped = false;
                "OK".to_string()
            }
            _ => "ERR unknown command".to_string(),
        };
        out.push(reply);
        out
    }
}

// ========== Connector / enumerator ==========

/// Connector that opens simulated instruments by path.
#[derive(Default)]
pub struct MockConnector {
    devices: Mutex<HashMap<String, SimulatedSmu>>,
    fail_next: AtomicUsize,
    opened: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `sim` reachable at `path`.
    pub fn attach(&self, path: impl Into<String>, sim: SimulatedSmu) {
        self.devices.lock().insert(path.into(), sim);
    }

    pub fn detach(&self, path: &str) {
        self.devices.lock().remove(path);
    }

    /// Fail the next `count` opens with an I/O error.
    pub fn fail_next_opens(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Paths passed to `open`, in order, including failed attempts.
    pub fn open_attempts(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl Connector for MockConnector {
    fn open(&self, path: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.opened.lock().push(path.to_string());

        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "simulated open failure",
            )));
        }

        let sim = self
            .devices
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::not_found(path))?;
        if !sim.is_plugged() {
            return Err(TransportError::not_found(path));
        }

        Ok(Box::new(LineTransport::new(sim.port(path), "\n")))
    }
}

/// Enumerator returning a fixed, mutable list of ports.
#[derive(Clone, Default)]
pub struct StaticEnumerator {
    ports: Arc<Mutex<Vec<SerialPortInfo>>>,
    failing: Arc<AtomicBool>,
}

impl StaticEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a USB port with the given vendor/product ids.
    pub fn add_usb(&self, path: &str, vid: u16, pid: u16, product: Option<&str>) {
        self.ports.lock().push(SerialPortInfo {
            port_name: path.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: None,
                manufacturer: None,
                product: product.map(str::to_string),
            }),
        });
    }

    /// Add a port with no USB information.
    pub fn add_plain(&self, path: &str) {
        self.ports.lock().push(SerialPortInfo {
            port_name: path.to_string(),
            port_type: SerialPortType::Unknown,
        });
    }

    pub fn remove(&self, path: &str) {
        self.ports.lock().retain(|p| p.port_name != path);
    }

    /// Make enumeration fail at the "OS" level.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl PortEnumerator for StaticEnumerator {
    fn enumerate(&self) -> Result<Vec<SerialPortInfo>, ScanError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ScanError::Other("simulated enumeration failure".into()));
        }
        Ok(self.ports.lock().clone())
    }
}
