//! Async driver for the Okolab H401-T dual-channel temperature controller.
//!
//! The controller speaks a line-oriented ASCII protocol over a USB-serial
//! bridge. This crate provides discovery, connection management with
//! optional automatic reconnection, and a typed command facade.
//!
//! ```no_run
//! use okolab::{Channel, Device, DeviceOptions};
//!
//! # async fn demo() -> okolab::Result<()> {
//! let device = Device::new(DeviceOptions::default());
//! device.connect().await?;
//! if let Some(temp) = device.temperature(Channel::One).await? {
//!     println!("chamber at {:.1} C", temp);
//! }
//! device.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod error;
pub mod events;
pub mod protocol;
pub mod transport;

mod reconnect;

pub use device::{ConnectionState, Device, DeviceOptions, SETPOINT_MAX, SETPOINT_MIN};
pub use error::{Error, ProtocolError, Result, SystemError};
pub use events::{DeviceEvent, EventReceiver};
pub use protocol::{Channel, Side, Status};
pub use transport::{list_ports, PortCandidate};
