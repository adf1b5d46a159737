//! Newline framing over a byte-level adapter.

use super::error::TransportError;
use super::traits::{SerialPortAdapter, Transport};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lines longer than this without a newline are handed up as-is so a
/// babbling device cannot grow the buffer forever.
const MAX_LINE_LEN: usize = 4096;

const READ_CHUNK: usize = 256;

/// `Transport` that frames lines on `\n` over any `SerialPortAdapter`.
///
/// `\r\n` endings are accepted; blank lines are skipped. The adapter is
/// dropped on `close`, which releases the OS handle.
#[derive(Debug)]
pub struct LineTransport<A: SerialPortAdapter> {
    adapter: Option<A>,
    name: String,
    terminator: String,
    pending: Vec<u8>,
    write_timeout: Duration,
}

impl<A: SerialPortAdapter> LineTransport<A> {
    pub fn new(adapter: A, terminator: impl Into<String>) -> Self {
        Self {
            name: adapter.name().to_string(),
            adapter: Some(adapter),
            terminator: terminator.into(),
            pending: Vec::with_capacity(READ_CHUNK),
            write_timeout: Duration::from_millis(200),
        }
    }

    /// Budget for a single `write_line`.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Drop the adapter and report the link as gone.
    fn lose(&mut self, cause: TransportError) -> TransportError {
        warn!(port = %self.name, error = %cause, "serial link lost");
        self.adapter = None;
        self.pending.clear();
        TransportError::Disconnected
    }

    fn take_line(&mut self) -> Option<String> {
        let end = match memchr::memchr(b'\n', &self.pending) {
            Some(pos) => pos + 1,
            None if self.pending.len() >= MAX_LINE_LEN => self.pending.len(),
            None => return None,
        };
        let raw: Vec<u8> = self.pending.drain(..end).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }
}

impl<A: SerialPortAdapter> Transport for LineTransport<A> {
    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            while let Some(line) = self.take_line() {
                if !line.is_empty() {
                    debug!(port = %self.name, rx = %line, "serial rx");
                    return Ok(line);
                }
            }

            let Some(adapter) = self.adapter.as_mut() else {
                return Err(TransportError::Disconnected);
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::timeout(timeout));
            }
            let step = adapter
                .set_timeout(remaining)
                .and_then(|()| adapter.read_bytes(&mut chunk));
            match step {
                Ok(0) => {}
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(self.lose(e)),
            }
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut frame = Vec::with_capacity(line.len() + self.terminator.len());
        frame.extend_from_slice(line.as_bytes());
        frame.extend_from_slice(self.terminator.as_bytes());

        let write_timeout = self.write_timeout;
        let Some(adapter) = self.adapter.as_mut() else {
            return Err(TransportError::Disconnected);
        };
        if let Err(e) = adapter.set_timeout(write_timeout) {
            return Err(self.lose(e));
        }

        debug!(port = %self.name, tx = %line, "serial tx");
        let mut written = 0;
        while written < frame.len() {
            let Some(adapter) = self.adapter.as_mut() else {
                return Err(TransportError::Disconnected);
            };
            match adapter.write_bytes(&frame[written..]) {
                Ok(0) | Err(TransportError::Timeout(_)) => {
                    return Err(TransportError::timeout(write_timeout));
                }
                Ok(n) => written += n,
                Err(e) => return Err(self.lose(e)),
            }
        }
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        let Some(adapter) = self.adapter.as_mut() else {
            return Err(TransportError::Disconnected);
        };
        match adapter.clear_buffers() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.lose(e)),
        }
    }

    fn close(&mut self) {
        if self.adapter.take().is_some() {
            debug!(port = %self.name, "serial port closed");
        }
        self.pending.clear();
    }

    fn name(&self) -> &str {
        &self.name
    }
}
