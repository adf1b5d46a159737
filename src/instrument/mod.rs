//! Serialized access to the instrument.
//!
//! `InstrumentLink` owns the current transport behind one mutex. Every
//! exchange with the device (a poll cycle, a user command, the identify
//! handshake) runs inside [`InstrumentLink::transaction`] so request/reply
//! pairs from different threads never interleave on the wire.

pub mod protocol;

use crate::port::{Transport, TransportError};
use parking_lot::Mutex;
use protocol::{Ack, Notice, ProtocolParseError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Stale lines drained per cycle at most.
const MAX_STALE_LINES: usize = 64;
/// Read slice used while draining stale input.
const DRAIN_SLICE: Duration = Duration::from_millis(1);

/// Failure of an exchange with the instrument.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("No instrument attached")]
    NotAttached,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolParseError),

    #[error("Device rejected command: {0}")]
    DeviceRejected(String),

    #[error("Device is not an SMU (identity {0:?})")]
    NotInstrument(String),
}

impl LinkError {
    /// True when the link can no longer be used.
    pub fn is_link_loss(&self) -> bool {
        match self {
            Self::NotAttached => true,
            Self::Transport(e) => e.is_link_loss(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Timeout(_)))
    }
}

#[derive(Debug, Default)]
struct LinkInner {
    transport: Option<Box<dyn Transport>>,
    notices: Vec<Notice>,
}

/// One locked conversation with the device.
pub struct Session<'a> {
    transport: &'a mut dyn Transport,
    notices: &'a mut Vec<Notice>,
    timeout: Duration,
}

impl Session<'_> {
    /// Drop replies left over from earlier exchanges, keeping notifications.
    pub fn drain_stale(&mut self) -> Result<(), LinkError> {
        for _ in 0..MAX_STALE_LINES {
            match self.transport.read_line(DRAIN_SLICE) {
                Ok(line) => {
                    if let Some(stale) = self.route(line) {
                        debug!(line = %stale, "discarding stale reply");
                    }
                }
                Err(TransportError::Timeout(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Send `command` and return the first non-notification reply line.
    pub fn query(&mut self, command: &str) -> Result<String, LinkError> {
        self.transport.write_line(command)?;
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::timeout(self.timeout).into());
            }
            let line = self.transport.read_line(remaining)?;
            if let Some(reply) = self.route(line) {
                return Ok(reply);
            }
        }
    }

    /// Send a set-command and require `OK`.
    pub fn command(&mut self, command: &str) -> Result<(), LinkError> {
        let reply = self.query(command)?;
        match protocol::parse_ack(&reply)? {
            Ack::Ok => Ok(()),
            Ack::Rejected(message) => Err(LinkError::DeviceRejected(message)),
        }
    }

    /// Send a measurement query and parse the number.
    pub fn measure(&mut self, command: &str) -> Result<f64, LinkError> {
        let reply = self.query(command)?;
        Ok(protocol::parse_number(&reply)?)
    }

    /// Stash notifications; hand everything else back.
    fn route(&mut self, line: String) -> Option<String> {
        match protocol::parse_notice(&line) {
            Some(notice) => {
                info!(?notice, "device notification");
                self.notices.push(notice);
                None
            }
            None => Some(line),
        }
    }
}

/// Owner of the (at most one) open transport.
#[derive(Debug)]
pub struct InstrumentLink {
    inner: Mutex<LinkInner>,
    reply_timeout: Duration,
}

impl InstrumentLink {
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(LinkInner::default()),
            reply_timeout,
        }
    }

    /// Identify the device on `transport` and make it the current link.
    ///
    /// The reply to `*IDN?` must contain `marker` (case-insensitive); on any
    /// failure `transport` is closed and the previous link is left untouched.
    pub fn connect(&self, mut transport: Box<dyn Transport>, marker: &str) -> Result<String, LinkError> {
        let mut inner = self.inner.lock();
        let mut notices = Vec::new();

        let identity = {
            let mut session = Session {
                transport: transport.as_mut(),
                notices: &mut notices,
                timeout: self.reply_timeout,
            };
            session
                .transport
                .discard_input()
                .map_err(LinkError::from)
                .and_then(|()| session.query(protocol::IDENTIFY))
        };

        let identity = match identity {
            Ok(id) if id.to_ascii_uppercase().contains(&marker.to_ascii_uppercase()) => id,
            Ok(id) => {
                transport.close();
                return Err(LinkError::NotInstrument(id));
            }
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };

        if let Some(mut old) = inner.transport.take() {
            old.close();
        }
        info!(port = transport.name(), identity = %identity, "instrument identified");
        inner.transport = Some(transport);
        inner.notices = notices;
        Ok(identity)
    }

    /// Close and forget the current transport. Returns whether one was open.
    pub fn detach(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.notices.clear();
        match inner.transport.take() {
            Some(mut transport) => {
                transport.close();
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().transport.is_some()
    }

    /// Run `f` with exclusive access to the device.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Session<'_>) -> Result<T, LinkError>,
    ) -> Result<T, LinkError> {
        let mut guard = self.inner.lock();
        let LinkInner { transport, notices } = &mut *guard;
        let transport = transport.as_deref_mut().ok_or(LinkError::NotAttached)?;
        let mut session = Session {
            transport,
            notices,
            timeout: self.reply_timeout,
        };
        f(&mut session)
    }

    /// Notifications collected since the last call.
    pub fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut self.inner.lock().notices)
    }
}
