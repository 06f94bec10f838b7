//! Serial port transport backed by the `serialport` crate.
//!
//! The crate's I/O is synchronous, so every operation runs on Tokio's
//! blocking executor with the port behind an `Arc<Mutex>`, keeping the
//! async callers off the blocking reads.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, trace, warn};
use serialport::{SerialPort, SerialPortType};
use tokio::sync::Mutex;

use super::{Port, PortCandidate, PortProvider};

/// Fixed line speed of the controller's USB-serial bridge.
pub const BAUD_RATE: u32 = 115200;

/// USB vendor id of the controller's bridge chip.
const USB_VID: u16 = 0x03eb;

/// USB product id of the controller's bridge chip.
const USB_PID: u16 = 0x2404;

/// Poll interval for the blocking read loop. Short enough that the
/// overall deadline is respected to within one tick.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// A [`Port`] over a physical serial device.
pub struct SerialTransport {
    address: String,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Open the serial device at `address`.
    pub async fn open(address: &str) -> io::Result<Self> {
        let path = address.to_string();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&path, BAUD_RATE)
                .timeout(POLL_TIMEOUT)
                .open()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        debug!("Opened serial port {}", address);
        Ok(Self {
            address: address.to_string(),
            port: Some(Arc::new(Mutex::new(port))),
        })
    }

    fn port(&self) -> io::Result<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .as_ref()
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

#[async_trait]
impl Port for SerialTransport {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        let bytes = bytes.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut port = port.blocking_lock();
            port.write_all(&bytes)?;
            port.flush()
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    async fn read_until(&mut self, delimiter: u8, timeout: Duration) -> io::Result<Vec<u8>> {
        let port = self.port()?;

        tokio::task::spawn_blocking(move || {
            let mut port = port.blocking_lock();
            let deadline = Instant::now() + timeout;
            let mut response = Vec::new();
            let mut byte = [0u8; 1];

            loop {
                match port.read(&mut byte) {
                    Ok(1) => {
                        response.push(byte[0]);
                        if byte[0] == delimiter {
                            trace!("Read frame of {} bytes", response.len());
                            return Ok(response);
                        }
                    }
                    Ok(_) => {}
                    // The per-read timeout is just the poll tick; only the
                    // overall deadline counts.
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                    Err(e) => return Err(e),
                }
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no response before deadline",
                    ));
                }
            }
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.address);
        }
    }
}

/// [`PortProvider`] for physical serial devices.
pub struct SerialPortProvider;

#[async_trait]
impl PortProvider for SerialPortProvider {
    async fn open(&self, address: &str) -> io::Result<Box<dyn Port>> {
        Ok(Box::new(SerialTransport::open(address).await?))
    }

    fn list(&self, all: bool) -> Vec<PortCandidate> {
        list_ports(all)
    }
}

/// Enumerate serial ports, filtered by the vendor's USB identifiers
/// unless `all` is set.
pub fn list_ports(all: bool) -> Vec<PortCandidate> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("Serial port enumeration failed: {}", e);
            return Vec::new();
        }
    };

    ports
        .into_iter()
        .filter_map(|info| match info.port_type {
            SerialPortType::UsbPort(usb) => {
                if all || (usb.vid == USB_VID && usb.pid == USB_PID) {
                    Some(PortCandidate {
                        address: info.port_name,
                        serial_number: usb.serial_number,
                    })
                } else {
                    None
                }
            }
            _ if all => Some(PortCandidate {
                address: info.port_name,
                serial_number: None,
            }),
            _ => None,
        })
        .collect()
}
