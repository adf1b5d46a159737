//! Transport and discovery error types.
//!
//! Kept apart from the command and connection errors so the port layer can be
//! used (and tested) without the rest of the crate.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur on an open serial link.
///
/// `Timeout` means the device was silent for the whole budget but the link is
/// still believed to be alive. `Disconnected` is sticky: once a transport has
/// returned it, every later call returns it again without touching the OS.
/// The remaining variants are the I/O failure class.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No complete reply arrived within the budget.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The link is gone (device unplugged, port closed, or a fatal I/O error).
    #[error("Serial link disconnected")]
    Disconnected,

    /// The requested device path does not exist.
    #[error("Serial port not found: {0}")]
    NotFound(String),

    /// An I/O error occurred while talking to the port.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialport-specific error occurred (usually while opening).
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl TransportError {
    /// Create a Timeout error from a duration.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout(duration)
    }

    /// Create a NotFound error from a port path.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// True when this error means the link can no longer be used.
    pub fn is_link_loss(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Device enumeration failed at the OS level.
///
/// "No devices present" is not an error; it yields an empty candidate list.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Port enumeration failed: {0}")]
    Enumeration(#[from] serialport::Error),

    #[error("Port enumeration failed: {0}")]
    Other(String),
}
