//! Transport abstraction over the controller's serial link.
//!
//! [`Port`] is the byte-level seam the driver talks through; [`PortProvider`]
//! handles discovery and opening. Production code uses the `serialport`-backed
//! implementations in [`serial`]; tests substitute the in-memory ones in
//! [`mock`].

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub mod mock;
pub mod serial;

pub use serial::{list_ports, SerialPortProvider, BAUD_RATE};

/// An open byte stream to a controller.
#[async_trait]
pub trait Port: Send {
    /// Write a complete frame to the device.
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read bytes up to and including `delimiter`, bounded by `timeout`.
    ///
    /// Returns `ErrorKind::TimedOut` if the delimiter does not arrive in
    /// time. The returned buffer includes the delimiter.
    async fn read_until(&mut self, delimiter: u8, timeout: Duration) -> io::Result<Vec<u8>>;

    /// Release the underlying resource. Infallible by design of the
    /// callers: teardown paths must not produce secondary errors.
    async fn close(&mut self);
}

/// Discovery and opening of controller ports.
#[async_trait]
pub trait PortProvider: Send + Sync {
    /// Open the port at `address`.
    async fn open(&self, address: &str) -> io::Result<Box<dyn Port>>;

    /// Enumerate candidate ports. With `all` false, only ports matching
    /// the vendor's USB identifiers are returned.
    fn list(&self, all: bool) -> Vec<PortCandidate>;
}

/// A discovered serial port that may host a controller.
#[derive(Debug, Clone, Serialize)]
pub struct PortCandidate {
    /// OS port path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub address: String,

    /// USB serial number reported by the enumerator, when available.
    pub serial_number: Option<String>,
}
