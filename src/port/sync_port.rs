//! Synchronous serial port implementation.
//!
//! Wraps the `serialport` crate's `SerialPort` trait with our own `SerialPortAdapter`
//! trait so the framing layer can run over real hardware or the mock.

use super::error::TransportError;
use super::line::LineTransport;
use super::traits::{Connector, PortConfiguration, SerialPortAdapter, Transport};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::info;

/// Synchronous serial port implementation wrapping `serialport::SerialPort`.
pub struct SyncSerialPort {
    /// The underlying serial port implementation.
    port: Box<dyn serialport::SerialPort>,
    /// The port name/path for identification.
    name: String,
}

impl SyncSerialPort {
    /// Open a serial port (8N1, no flow control) with the given configuration.
    ///
    /// # Example
    /// ```no_run
    /// use smu_ctl::port::{PortConfiguration, SyncSerialPort};
    ///
    /// let port = SyncSerialPort::open("/dev/ttyACM0", &PortConfiguration::default())?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open(port_name: &str, config: &PortConfiguration) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .flow_control(serialport::FlowControl::None)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(config.timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::not_found(port_name),
                _ => TransportError::Serial(e),
            })?;

        Ok(Self {
            port,
            name: port_name.to_string(),
        })
    }
}

impl SerialPortAdapter for SyncSerialPort {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        match self.port.write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                Err(TransportError::timeout(self.port.timeout()))
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        match self.port.read(buffer) {
            // A zero-length read on a tty means the device went away.
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.port.set_timeout(timeout).map_err(TransportError::Serial)
    }

    fn clear_buffers(&mut self) -> Result<(), TransportError> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(TransportError::Serial)
    }
}

impl std::fmt::Debug for SyncSerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSerialPort")
            .field("name", &self.name)
            .field("baud_rate", &self.port.baud_rate().ok())
            .finish()
    }
}

/// Opens real serial ports and frames them into lines.
#[derive(Debug, Clone, Default)]
pub struct SerialConnector {
    config: PortConfiguration,
}

impl SerialConnector {
    pub fn new(config: PortConfiguration) -> Self {
        Self { config }
    }
}

impl Connector for SerialConnector {
    fn open(&self, path: &str) -> Result<Box<dyn Transport>, TransportError> {
        let mut port = SyncSerialPort::open(path, &self.config)?;
        port.clear_buffers()?;
        info!(port = path, baud = self.config.baud_rate, "serial port opened");
        Ok(Box::new(
            LineTransport::new(port, self.config.terminator.clone())
                .with_write_timeout(self.config.timeout),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_not_found_error() {
        let config = PortConfiguration::default();
        let result = SyncSerialPort::open("/dev/nonexistent_port_12345", &config);

        match result {
            Err(TransportError::NotFound(name)) => assert!(name.contains("nonexistent")),
            Err(TransportError::Serial(_)) => {}
            other => panic!("Expected open failure, got: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_connector_reports_missing_device() {
        let connector = SerialConnector::default();
        assert!(connector.open("/dev/nonexistent_port_12345").is_err());
    }
}
