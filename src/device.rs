//! Device facade and connection lifecycle.
//!
//! A [`Device`] owns one controller link. All commands funnel through a
//! single mutex-guarded request path, so concurrent callers are served
//! strictly in arrival order and a frame is never interleaved with
//! another. Lifecycle changes fan out as [`DeviceEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::events::{event_channel, DeviceEvent, EventReceiver, EventSender};
use crate::protocol::{self, Channel, Side, Status, IDENTIFY_TIMEOUT, REQUEST_TIMEOUT, TERMINATOR};
use crate::reconnect::{self, ReconnectHandle};
use crate::transport::{Port, PortCandidate, PortProvider, SerialPortProvider};

/// Lowest setpoint the controller accepts, in degrees Celsius.
pub const SETPOINT_MIN: f64 = 25.0;

/// Highest setpoint the controller accepts, in degrees Celsius.
pub const SETPOINT_MAX: f64 = 60.0;

/// Where a device is in its connection lifecycle.
///
/// `Closed` and `Lost` are terminal for the current port; a later
/// `connect` (or the reconnect loop) starts a fresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Lost,
}

/// Connection behavior knobs.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Fixed port address. When unset, discovery scans for candidates.
    pub address: Option<String>,

    /// Only accept a device whose serial number matches.
    pub target_serial: Option<String>,

    /// Start a background reconnect loop after a lost link.
    pub auto_reconnect: bool,

    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,

    /// Wait one interval before the first reconnect attempt.
    pub reconnect_initial_delay: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            address: None,
            target_serial: None,
            auto_reconnect: false,
            reconnect_interval: Duration::from_secs(1),
            reconnect_initial_delay: true,
        }
    }
}

impl DeviceOptions {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_target_serial(mut self, serial: impl Into<String>) -> Self {
        self.target_serial = Some(serial.into());
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_reconnect_initial_delay(mut self, delayed: bool) -> Self {
        self.reconnect_initial_delay = delayed;
        self
    }
}

struct Link {
    port: Option<Box<dyn Port>>,
    state: ConnectionState,
    address: Option<String>,
}

pub(crate) struct Shared {
    provider: Box<dyn PortProvider>,
    options: DeviceOptions,
    link: Mutex<Link>,
    events: EventSender,
}

impl Shared {
    pub(crate) fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub(crate) fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) async fn state(&self) -> ConnectionState {
        self.link.lock().await.state
    }

    /// Release the port and finalize the state as `Closed`. Returns
    /// whether a port was actually open; `Closed` is only announced
    /// when one was.
    pub(crate) async fn close_link(&self) -> bool {
        let mut link = self.link.lock().await;
        let port = link.port.take();
        link.state = ConnectionState::Closed;
        match port {
            Some(mut port) => {
                port.close().await;
                info!("Closed connection to {:?}", link.address);
                let _ = self.events.send(DeviceEvent::Closed);
                true
            }
            None => false,
        }
    }

    /// Run one full connection attempt, holding the link for its duration
    /// so no command can slip in half-connected.
    pub(crate) async fn try_connect(&self, reconnected: bool) -> Result<()> {
        let mut link = self.link.lock().await;
        if matches!(link.state, ConnectionState::Connected | ConnectionState::Connecting) {
            debug!("Connect requested while already {:?}", link.state);
            return Ok(());
        }
        // The loop must not resurrect a deliberately closed device;
        // only an explicit connect may leave Closed.
        if reconnected && link.state == ConnectionState::Closed {
            return Err(Error::Disconnected);
        }
        let was_lost = link.state == ConnectionState::Lost;
        link.state = ConnectionState::Connecting;

        let candidates = match &self.options.address {
            Some(address) => vec![PortCandidate {
                address: address.clone(),
                serial_number: None,
            }],
            None => self.provider.list(false),
        };

        // A fixed address with no target identity is taken on trust; the
        // probe is what distinguishes our device among scanned candidates
        // or confirms a configured serial number.
        let verify = self.options.target_serial.is_some() || self.options.address.is_none();

        for candidate in candidates {
            let mut port = match self.provider.open(&candidate.address).await {
                Ok(port) => port,
                Err(e) => {
                    debug!("Open failed for {}: {}", candidate.address, e);
                    continue;
                }
            };

            if verify {
                let serial = match self.verify_identity(&mut port).await {
                    Ok(serial) => serial,
                    Err(e) => {
                        debug!("Identity check failed on {}: {}", candidate.address, e);
                        port.close().await;
                        continue;
                    }
                };
                if let Some(target) = &self.options.target_serial {
                    if &serial != target {
                        debug!(
                            "Serial mismatch on {}: got {}, want {}",
                            candidate.address, serial, target
                        );
                        port.close().await;
                        continue;
                    }
                }
                info!("Connected to {} (serial {})", candidate.address, serial);
            } else {
                info!("Connected to {}", candidate.address);
            }

            link.port = Some(port);
            link.state = ConnectionState::Connected;
            link.address = Some(candidate.address);
            let _ = self.events.send(DeviceEvent::Connected { reconnected });
            return Ok(());
        }

        link.state = if was_lost {
            ConnectionState::Lost
        } else {
            ConnectionState::Disconnected
        };
        Err(Error::Disconnected)
    }

    /// Query the serial number on a freshly opened port. A device that
    /// does not answer correctly within the identity timeout is not ours.
    async fn verify_identity(&self, port: &mut Box<dyn Port>) -> Result<String> {
        let frame = protocol::encode(protocol::SERIAL_NUMBER_CODE, None);
        port.write_all(&frame).await.map_err(|_| Error::Disconnected)?;
        let raw = port
            .read_until(TERMINATOR, IDENTIFY_TIMEOUT)
            .await
            .map_err(|_| Error::Disconnected)?;
        Ok(protocol::decode(&raw)?.trim().to_string())
    }
}

/// Async client for one temperature controller.
pub struct Device {
    shared: Arc<Shared>,
    reconnect: Mutex<Option<ReconnectHandle>>,
}

impl Device {
    /// Create a device over the system serial ports.
    pub fn new(options: DeviceOptions) -> Self {
        Self::open(Box::new(SerialPortProvider), options)
    }

    /// Create a device over an arbitrary transport.
    pub fn open(provider: Box<dyn PortProvider>, options: DeviceOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                options,
                link: Mutex::new(Link {
                    port: None,
                    state: ConnectionState::Disconnected,
                    address: None,
                }),
                events: event_channel(),
            }),
            reconnect: Mutex::new(None),
        }
    }

    /// Open and verify a connection.
    ///
    /// A no-op when already connected. With no fixed address, candidates
    /// from discovery are tried in order until one passes identity
    /// verification.
    pub async fn connect(&self) -> Result<()> {
        self.shared.try_connect(false).await
    }

    /// Close the connection deliberately.
    ///
    /// Stops any reconnect loop, then releases the port. Returns
    /// [`Error::Disconnected`] when no port was open.
    pub async fn close(&self) -> Result<()> {
        if let Some(handle) = self.reconnect.lock().await.take() {
            handle.cancel().await;
        }

        if self.shared.close_link().await {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.shared.state().await
    }

    /// Address of the connected port, if any.
    pub async fn address(&self) -> Option<String> {
        self.shared.link.lock().await.address.clone()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events.subscribe()
    }

    /// Wait until the connection ends.
    ///
    /// Resolves `Ok` after a deliberate [`close`](Self::close) and
    /// [`Error::ConnectionLost`] after a link failure. Dropping the
    /// future before it resolves closes the connection: abandoning the
    /// watch means nobody is left to notice a dead link, so the port is
    /// shut down in an orderly way instead of being left open.
    pub async fn closed(&self) -> Result<()> {
        let mut guard = CloseOnDrop::new(Arc::clone(&self.shared));
        let result = self.wait_closed().await;
        guard.disarm();
        result
    }

    async fn wait_closed(&self) -> Result<()> {
        // Subscribe before checking state so an event between the check
        // and the first recv cannot be missed.
        let mut events = self.subscribe();
        {
            let link = self.shared.link.lock().await;
            match link.state {
                ConnectionState::Closed => return Ok(()),
                ConnectionState::Lost => return Err(Error::ConnectionLost),
                _ => {}
            }
        }
        loop {
            match events.recv().await {
                Ok(DeviceEvent::Closed) => return Ok(()),
                Ok(DeviceEvent::Lost) => return Err(Error::ConnectionLost),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Send one command and return the decoded payload.
    ///
    /// Requests are serialized FIFO by the link mutex. Any transport
    /// failure, timeouts included, tears the link down: the state moves
    /// to `Lost`, `Lost` is emitted once, and the reconnect loop starts
    /// if enabled. The failing call itself is never retried.
    async fn request(&self, code: &str, argument: Option<&str>) -> Result<String> {
        let mut link = self.shared.link.lock().await;

        let outcome = match (link.state, link.port.as_mut()) {
            (ConnectionState::Connected, Some(port)) => {
                let frame = protocol::encode(code, argument);
                match port.write_all(&frame).await {
                    Ok(()) => port.read_until(TERMINATOR, REQUEST_TIMEOUT).await,
                    Err(e) => Err(e),
                }
            }
            _ => return Err(Error::Disconnected),
        };

        match outcome {
            Ok(raw) => protocol::decode(&raw),
            Err(e) => {
                warn!("Link failed during command {}: {}", code, e);
                if let Some(mut port) = link.port.take() {
                    port.close().await;
                }
                link.state = ConnectionState::Lost;
                let _ = self.shared.events.send(DeviceEvent::Lost);
                drop(link);

                if self.shared.options.auto_reconnect {
                    self.start_reconnect().await;
                }
                Err(Error::Disconnected)
            }
        }
    }

    /// Start the reconnect loop, replacing any previous one. The old
    /// loop is cancelled and awaited first so two can never run at once.
    async fn start_reconnect(&self) {
        let mut slot = self.reconnect.lock().await;
        if let Some(handle) = slot.take() {
            handle.cancel().await;
        }
        *slot = Some(reconnect::spawn(Arc::clone(&self.shared)));
    }

    /// Measured temperature of a channel, `None` while the channel is off.
    pub async fn temperature(&self, channel: Channel) -> Result<Option<f64>> {
        let payload = self.request(channel.temperature_code(), None).await?;
        protocol::parse_optional_float(&payload)
    }

    /// Current setpoint of a channel, `None` while the channel is off.
    pub async fn setpoint(&self, channel: Channel) -> Result<Option<f64>> {
        let payload = self.request(channel.setpoint_read_code(), None).await?;
        protocol::parse_optional_float(&payload)
    }

    /// Program a channel setpoint.
    ///
    /// Values outside the controller's fixed range are rejected locally,
    /// before any frame is sent.
    pub async fn set_setpoint(&self, channel: Channel, value: f64) -> Result<()> {
        if !(SETPOINT_MIN..=SETPOINT_MAX).contains(&value) {
            return Err(Error::SetpointOutOfRange { value });
        }
        let argument = format!("{:.1}", value);
        self.request(channel.setpoint_write_code(), Some(&argument))
            .await?;
        Ok(())
    }

    /// The (min, max) setpoint range a channel reports.
    pub async fn setpoint_range(&self, channel: Channel) -> Result<(f64, f64)> {
        let min = self.request(channel.setpoint_min_code(), None).await?;
        let max = self.request(channel.setpoint_max_code(), None).await?;
        Ok((protocol::parse_float(&min)?, protocol::parse_float(&max)?))
    }

    /// Status of one channel.
    pub async fn channel_status(&self, channel: Channel) -> Result<Status> {
        let payload = self.request(channel.status_code(), None).await?;
        protocol::parse_status(&payload)
    }

    /// Overall controller status.
    pub async fn status(&self) -> Result<Status> {
        let payload = self.request(protocol::STATUS_CODE, None).await?;
        protocol::parse_status(&payload)
    }

    /// Product name string.
    pub async fn product_name(&self) -> Result<String> {
        let payload = self.request(protocol::PRODUCT_NAME_CODE, None).await?;
        Ok(payload.trim().to_string())
    }

    /// Device serial number.
    pub async fn serial_number(&self) -> Result<String> {
        let payload = self.request(protocol::SERIAL_NUMBER_CODE, None).await?;
        Ok(payload.trim().to_string())
    }

    /// Time since the controller booted.
    pub async fn uptime(&self) -> Result<chrono::Duration> {
        let payload = self.request(protocol::UPTIME_CODE, None).await?;
        protocol::parse_uptime(&payload)
    }

    /// Temperature of the controller's own board.
    pub async fn board_temperature(&self) -> Result<f64> {
        let payload = self.request(protocol::BOARD_TEMPERATURE_CODE, None).await?;
        protocol::parse_float(&payload)
    }

    /// Controller clock.
    pub async fn time(&self) -> Result<NaiveDateTime> {
        let payload = self.request(protocol::CLOCK_READ_CODE, None).await?;
        protocol::parse_datetime(&payload)
    }

    /// Set the controller clock.
    pub async fn set_time(&self, time: &NaiveDateTime) -> Result<()> {
        let argument = protocol::format_datetime(time);
        self.request(protocol::CLOCK_WRITE_CODE, Some(&argument))
            .await?;
        Ok(())
    }

    /// Configured device type of a channel, `None` when disabled.
    pub async fn channel_type(&self, channel: Channel) -> Result<Option<i32>> {
        let payload = self.request(channel.type_read_code(), None).await?;
        protocol::parse_optional_id(&payload)
    }

    /// Configure a channel's device type, or disable it with `None`.
    /// For metal-glass plates a side selection may follow.
    pub async fn set_channel_type(
        &self,
        channel: Channel,
        type_id: Option<i32>,
        side: Option<Side>,
    ) -> Result<()> {
        let argument = type_id.unwrap_or(-1).to_string();
        self.request(channel.type_write_code(), Some(&argument))
            .await?;
        if let Some(side) = side {
            let argument = side.code().to_string();
            self.request(channel.side_write_code(), Some(&argument))
                .await?;
        }
        Ok(())
    }
}

/// Closes the link if dropped while still armed.
///
/// Backs the cancellation contract of [`Device::closed`]: a waiter that
/// is dropped mid-wait triggers an orderly close rather than leaving
/// the port open with nobody watching it.
struct CloseOnDrop {
    shared: Arc<Shared>,
    armed: bool,
}

impl CloseOnDrop {
    fn new(shared: Arc<Shared>) -> Self {
        Self { shared, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Drop cannot await; hand the close to the runtime if one is
        // still there to run it.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            runtime.spawn(async move {
                shared.close_link().await;
            });
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Drop cannot await an orderly cancel; abort is enough to stop
        // the loop from reopening ports after the device is gone.
        if let Ok(mut slot) = self.reconnect.try_lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl PortCandidate {
    /// Connect to this discovered port.
    pub async fn connect(&self, options: DeviceOptions) -> Result<Device> {
        let device = Device::new(options.with_address(self.address.clone()));
        device.connect().await?;
        Ok(device)
    }
}
