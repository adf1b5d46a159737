//! SMU wire protocol: command strings and reply parsing.

use thiserror::Error;

pub const IDENTIFY: &str = "*IDN?";
pub const MEASURE_VOLTAGE: &str = ":MEAS:VOLT?";
pub const MEASURE_CURRENT: &str = ":MEAS:CURR?";
pub const ZERO: &str = ":SYST:ZERO";

/// Prefix of unsolicited device notifications.
pub const NOTICE_PREFIX: char = '!';

/// A reply that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolParseError {
    #[error("invalid number in reply: {0:?}")]
    InvalidNumber(String),

    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(String),
}

/// Device answer to a set-command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Rejected(String),
}

/// Unsolicited line pushed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Over-current protection fired; output is already off on the device.
    Trip(String),
    Other(String),
}

/// Render a number the way the firmware parses it (always with a decimal
/// point, never in exponent form, no precision lost).
fn format_number(value: f64) -> String {
    let mut text = value.to_string();
    if !text.contains('.') {
        text.push_str(".0");
    }
    text
}

pub fn set_voltage(volts: f64) -> String {
    format!(":SOUR:VOLT {}", format_number(volts))
}

pub fn set_current(amps: f64) -> String {
    format!(":SOUR:CURR {}", format_number(amps))
}

pub fn output(enabled: bool) -> &'static str {
    if enabled {
        ":OUTP ON"
    } else {
        ":OUTP OFF"
    }
}

/// Parse a measurement reply. Non-finite values are rejected.
pub fn parse_number(reply: &str) -> Result<f64, ProtocolParseError> {
    match reply.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ProtocolParseError::InvalidNumber(reply.to_string())),
    }
}

/// Parse the reply to a set-command: `OK` or `ERR <message>`.
pub fn parse_ack(reply: &str) -> Result<Ack, ProtocolParseError> {
    let reply = reply.trim();
    if reply.eq_ignore_ascii_case("OK") {
        return Ok(Ack::Ok);
    }
    match reply.get(..3).zip(reply.get(3..)) {
        Some((head, rest))
            if head.eq_ignore_ascii_case("ERR")
                && rest.chars().next().map_or(true, char::is_whitespace) =>
        {
            let message = rest.trim();
            Ok(Ack::Rejected(if message.is_empty() {
                "device error".to_string()
            } else {
                message.to_string()
            }))
        }
        _ => Err(ProtocolParseError::UnexpectedReply(reply.to_string())),
    }
}

/// Classify a `!`-prefixed line. Returns `None` for ordinary replies.
pub fn parse_notice(line: &str) -> Option<Notice> {
    let body = line.trim().strip_prefix(NOTICE_PREFIX)?.trim();
    let (kind, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
    if kind.eq_ignore_ascii_case("TRIP") {
        let reason = rest.trim();
        Some(Notice::Trip(if reason.is_empty() {
            "over-current".to_string()
        } else {
            reason.to_string()
        }))
    } else {
        Some(Notice::Other(body.to_string()))
    }
}
