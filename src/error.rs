//! Top-level application error and its mapping to process exit codes.

use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a fatal startup error (bad configuration, unusable log file).
pub const EXIT_STARTUP: u8 = 1;
/// Exit code when this host has no usable serial backend.
pub const EXIT_NO_TRANSPORT: u8 = 3;

/// Unified application error type for `main`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No usable serial transport on this host")]
    NoTransport,

    #[error("Failed to open log file '{path}': {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NoTransport => EXIT_NO_TRANSPORT,
            Self::Config(_) | Self::LogFile { .. } | Self::Io(_) => EXIT_STARTUP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppError::NoTransport.exit_code(), 3);
        let err: AppError = ConfigError::validation("serial.baud_rate", "must be positive").into();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("serial.baud_rate"));
    }
}
