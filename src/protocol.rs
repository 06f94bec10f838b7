//! Wire protocol for the H401-T command set.
//!
//! Requests are `<3-digit command code><optional argument>\r` in ASCII.
//! Successful responses carry a 3-character echo/status prefix followed by
//! the payload; errors come back as `E<integer code>`. Payloads are plain
//! numbers, fixed-format dates (`MM/DD/YYYY HH:MM:SS`) or uptime strings
//! (`"<days> d, HH:MM:SS"`). A channel that is switched off reports one of
//! the sentinels `OFF`, `OPEN` or `Disabled` instead of a number.

use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::{Error, ProtocolError, Result, SystemError};

/// Frame terminator byte for both requests and responses.
pub const TERMINATOR: u8 = b'\r';

/// Hard upper bound on a request round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on the serial number query used for identity verification.
pub const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// Format string for the controller clock.
const CLOCK_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// Payloads meaning "channel not active" rather than a numeric value.
const INACTIVE_SENTINELS: [&str; 3] = ["OFF", "OPEN", "Disabled"];

// Command codes that are not channel-specific.
pub(crate) const STATUS_CODE: &str = "110";
pub(crate) const PRODUCT_NAME_CODE: &str = "017";
pub(crate) const SERIAL_NUMBER_CODE: &str = "018";
pub(crate) const UPTIME_CODE: &str = "025";
pub(crate) const BOARD_TEMPERATURE_CODE: &str = "026";
pub(crate) const CLOCK_READ_CODE: &str = "070";
pub(crate) const CLOCK_WRITE_CODE: &str = "071";

/// One of the controller's two independently controlled device slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Channel {
    One,
    Two,
}

impl Channel {
    /// Slot number as printed on the controller.
    pub fn index(self) -> u8 {
        match self {
            Channel::One => 1,
            Channel::Two => 2,
        }
    }

    pub(crate) fn temperature_code(self) -> &'static str {
        match self {
            Channel::One => "001",
            Channel::Two => "037",
        }
    }

    pub(crate) fn setpoint_read_code(self) -> &'static str {
        match self {
            Channel::One => "002",
            Channel::Two => "067",
        }
    }

    pub(crate) fn setpoint_write_code(self) -> &'static str {
        match self {
            Channel::One => "008",
            Channel::Two => "063",
        }
    }

    pub(crate) fn setpoint_min_code(self) -> &'static str {
        match self {
            Channel::One => "005",
            Channel::Two => "068",
        }
    }

    pub(crate) fn setpoint_max_code(self) -> &'static str {
        match self {
            Channel::One => "006",
            Channel::Two => "069",
        }
    }

    pub(crate) fn status_code(self) -> &'static str {
        match self {
            Channel::One => "004",
            Channel::Two => "039",
        }
    }

    pub(crate) fn type_read_code(self) -> &'static str {
        match self {
            Channel::One => "111",
            Channel::Two => "113",
        }
    }

    pub(crate) fn type_write_code(self) -> &'static str {
        match self {
            Channel::One => "112",
            Channel::Two => "114",
        }
    }

    pub(crate) fn side_write_code(self) -> &'static str {
        match self {
            Channel::One => "116",
            Channel::Two => "118",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel {}", self.index())
    }
}

/// Controller status as reported by commands 004/039/110.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Ok,
    Transient,
    Alarm,
    Error,
    Disabled,
}

impl Status {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Status::Ok),
            1 => Some(Status::Transient),
            2 => Some(Status::Alarm),
            3 => Some(Status::Error),
            4 => Some(Status::Disabled),
            _ => None,
        }
    }
}

/// Plate side selector for metal-glass plates (commands 116/118).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    NotSpecified,
    Glass,
    Metal,
}

impl Side {
    pub(crate) fn code(self) -> i32 {
        match self {
            Side::NotSpecified => 0,
            Side::Glass => 1,
            Side::Metal => 2,
        }
    }
}

/// Build the wire frame for a command and optional argument.
///
/// No escaping is defined by the protocol; arguments are always numeric or
/// fixed-format date strings.
pub fn encode(code: &str, argument: Option<&str>) -> Vec<u8> {
    debug_assert!(code.len() == 3 && code.bytes().all(|b| b.is_ascii_digit()));

    let mut frame = Vec::with_capacity(4 + argument.map_or(0, str::len));
    frame.extend_from_slice(code.as_bytes());
    if let Some(arg) = argument {
        frame.extend_from_slice(arg.as_bytes());
    }
    frame.push(TERMINATOR);
    frame
}

/// Decode a raw response frame into its payload.
///
/// `E<code>` frames are translated through the fixed error table and
/// surface as [`Error::System`]. Success frames yield the payload after
/// the 3-character echo/status prefix, terminator stripped.
pub fn decode(raw: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidEncoding)?;
    let text = text.strip_suffix('\r').unwrap_or(text);

    if let Some(code) = text.strip_prefix('E') {
        let code: i32 = code
            .trim()
            .parse()
            .map_err(|_| ProtocolError::MalformedErrorCode(text.to_string()))?;
        return Err(Error::System(SystemError::from_code(code)));
    }

    // get() also rejects a prefix whose third byte falls inside a
    // multibyte character, which a plain slice would panic on.
    match text.get(3..) {
        Some(payload) => Ok(payload.to_string()),
        None => Err(ProtocolError::ResponseTooShort(text.to_string()).into()),
    }
}

/// Parse a numeric payload.
pub fn parse_float(payload: &str) -> Result<f64> {
    payload
        .trim()
        .parse()
        .map_err(|_| ProtocolError::MalformedNumber(payload.to_string()).into())
}

/// Parse a numeric payload that may instead be an inactive-channel sentinel.
///
/// `OFF`, `OPEN` and `Disabled` all map to `None`; protocol revisions
/// disagree on which one a degraded channel reports, so all three are
/// accepted.
pub fn parse_optional_float(payload: &str) -> Result<Option<f64>> {
    let trimmed = payload.trim();
    if INACTIVE_SENTINELS.contains(&trimmed) {
        return Ok(None);
    }
    parse_float(trimmed).map(Some)
}

/// Parse a channel type id; negative ids mean the channel is disabled.
pub fn parse_optional_id(payload: &str) -> Result<Option<i32>> {
    let id: i32 = payload
        .trim()
        .parse()
        .map_err(|_| ProtocolError::MalformedNumber(payload.to_string()))?;
    Ok((id >= 0).then_some(id))
}

/// Parse a status payload through the fixed status enumeration.
pub fn parse_status(payload: &str) -> Result<Status> {
    let code: i32 = payload
        .trim()
        .parse()
        .map_err(|_| ProtocolError::MalformedNumber(payload.to_string()))?;
    Status::from_code(code).ok_or_else(|| ProtocolError::UnknownStatus(code).into())
}

/// Parse a controller clock payload (`MM/DD/YYYY HH:MM:SS`).
pub fn parse_datetime(payload: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(payload.trim(), CLOCK_FORMAT)
        .map_err(|_| ProtocolError::MalformedDate(payload.to_string()).into())
}

/// Format a timestamp for the controller clock (command 071).
pub fn format_datetime(time: &NaiveDateTime) -> String {
    time.format(CLOCK_FORMAT).to_string()
}

/// Parse an uptime payload (`"<days> d, HH:MM:SS"`).
pub fn parse_uptime(payload: &str) -> Result<chrono::Duration> {
    let malformed = || ProtocolError::MalformedUptime(payload.to_string());

    let trimmed = payload.trim();
    let (days, clock) = trimmed.split_once(" d, ").ok_or_else(malformed)?;
    let days: i64 = days.trim().parse().map_err(|_| malformed())?;

    let mut fields = clock.split(':');
    let mut next = || -> Result<i64> {
        fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| malformed().into())
    };
    let (hours, minutes, seconds) = (next()?, next()?, next()?);
    if fields.next().is_some() {
        return Err(malformed().into());
    }

    // Checked arithmetic: an absurd day count is a malformed payload,
    // not a crash.
    let total = days
        .checked_mul(86_400)
        .and_then(|t| hours.checked_mul(3_600).and_then(|h| t.checked_add(h)))
        .and_then(|t| minutes.checked_mul(60).and_then(|m| t.checked_add(m)))
        .and_then(|t| t.checked_add(seconds))
        .ok_or_else(malformed)?;
    chrono::Duration::try_seconds(total).ok_or_else(|| malformed().into())
}
