//! Core traits for the serial transport.
//!
//! Two layers: `SerialPortAdapter` moves raw bytes and is implemented by the
//! real port and by the mock; `Transport` speaks whole lines and is what the
//! rest of the crate sees. `Connector` opens a `Transport` for a device path.

use super::error::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters used when opening the instrument's serial port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfiguration {
    /// Baud rate (bits per second).
    pub baud_rate: u32,

    /// Default read/write timeout applied at open time.
    pub timeout: Duration,

    /// Line terminator appended to every outgoing command.
    pub terminator: String,
}

impl Default for PortConfiguration {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            timeout: Duration::from_millis(200),
            terminator: "\n".to_string(),
        }
    }
}

/// Byte-level access to a serial device.
///
/// `read_bytes` returns `Ok(0)` when nothing arrived before the configured
/// timeout; any `Err` is treated by callers as a dead link.
pub trait SerialPortAdapter: Send + std::fmt::Debug {
    /// Write bytes to the serial port.
    ///
    /// Returns the number of bytes actually written.
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read bytes from the serial port into the provided buffer.
    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError>;

    /// Get the name/path of this serial port.
    fn name(&self) -> &str;

    /// Set the timeout for the next blocking read or write.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Discard unread input and unsent output.
    fn clear_buffers(&mut self) -> Result<(), TransportError>;
}

/// Line-oriented access to the instrument.
pub trait Transport: Send + std::fmt::Debug {
    /// Read one line (terminator stripped, surrounding whitespace trimmed).
    ///
    /// Never blocks longer than `timeout`.
    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError>;

    /// Write one line; the terminator is appended.
    fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Drop anything already received but not yet read.
    fn discard_input(&mut self) -> Result<(), TransportError>;

    /// Close the link. Later calls return `TransportError::Disconnected`.
    fn close(&mut self);

    /// Device path this transport was opened on.
    fn name(&self) -> &str;
}

/// Opens transports by device path.
pub trait Connector: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn Transport>, TransportError>;
}
