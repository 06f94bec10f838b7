//! Error types for the driver.
//!
//! The taxonomy follows the failure modes of the controller link:
//!
//! - [`Error::Disconnected`]: the transport could not be opened, or a request
//!   could not be completed because no live port exists. The driver never
//!   retries these on its own; the caller (or the reconnection loop) decides.
//! - [`Error::ConnectionLost`]: a wait for closure ended because the wire
//!   died rather than because [`close`](crate::Device::close) was called.
//! - [`Error::Protocol`]: a response arrived but did not parse. The link is
//!   presumed alive; this signals a firmware anomaly or a driver bug.
//! - [`Error::System`]: the controller itself rejected the command with an
//!   `E<code>` frame. Carries the decoded reason, never retried.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level driver error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("controller is disconnected")]
    Disconnected,

    #[error("connection to the controller was lost")]
    ConnectionLost,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("controller error: {0}")]
    System(#[from] SystemError),

    #[error("setpoint {value} C outside the supported 25.0-60.0 C range")]
    SetpointOutOfRange { value: f64 },
}

/// A response frame was received but did not parse per the expected format.
///
/// Protocol errors never change the connection state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("response is not valid ASCII")]
    InvalidEncoding,

    #[error("response too short: {0:?}")]
    ResponseTooShort(String),

    #[error("malformed error code: {0:?}")]
    MalformedErrorCode(String),

    #[error("malformed numeric payload: {0:?}")]
    MalformedNumber(String),

    #[error("malformed date payload: {0:?}")]
    MalformedDate(String),

    #[error("malformed uptime payload: {0:?}")]
    MalformedUptime(String),

    #[error("unknown status code {0}")]
    UnknownStatus(i32),
}

/// A semantic error reported by the controller via an `E<code>` frame.
///
/// Codes not present in the documented table map to [`Unclassified`]
/// rather than being dropped silently.
///
/// [`Unclassified`]: SystemError::Unclassified
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemError {
    #[error("command id not valid")]
    CommandIdNotValid,

    #[error("message request too long")]
    RequestTooLong,

    #[error("message request too short")]
    RequestTooShort,

    #[error("command cannot be executed")]
    CannotExecute,

    #[error("value out of range")]
    ValueOutOfRange,

    #[error("value not available")]
    ValueNotAvailable,

    #[error("generic error")]
    Generic,

    #[error("request not properly formatted")]
    MalformedRequest,

    #[error("unclassified controller error {0}")]
    Unclassified(i32),
}

impl SystemError {
    /// Map a numeric error code from the wire to its semantic kind.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => SystemError::CommandIdNotValid,
            2 => SystemError::RequestTooLong,
            3 => SystemError::RequestTooShort,
            4 => SystemError::CannotExecute,
            5 => SystemError::ValueOutOfRange,
            6 => SystemError::ValueNotAvailable,
            8 => SystemError::Generic,
            15 => SystemError::MalformedRequest,
            other => SystemError::Unclassified(other),
        }
    }
}
