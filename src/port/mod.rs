//! Port abstraction layer for serial communication.
//!
//! Byte-level adapters (real and mock), line framing on top of them, and
//! device discovery. Everything above this module talks to `Transport`.

pub mod error;
pub mod line;
pub mod mock;
pub mod scanner;
pub mod sync_port;
pub mod traits;

pub use error::{ScanError, TransportError};
pub use line::LineTransport;
pub use mock::{MockConnector, MockSerialPort, SimulatedSmu, StaticEnumerator};
pub use scanner::{
    DeviceFilter, PortDescriptor, PortEnumerator, PortScanner, SystemEnumerator, VID_RASPBERRY_PI,
};
pub use sync_port::{SerialConnector, SyncSerialPort};
pub use traits::*;

/// Whether the `serialport` backend supports this host.
pub fn transport_available() -> bool {
    cfg!(any(unix, windows))
}
