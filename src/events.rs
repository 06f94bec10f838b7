//! Connection lifecycle notifications.
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel so any
//! number of observers can watch a device without holding it up. A slow
//! subscriber that lags simply misses events; the device never blocks on
//! delivery.

use tokio::sync::broadcast;

/// Channel depth. Lifecycle events are rare, so this is generous.
const EVENT_CAPACITY: usize = 32;

/// A change in a device's connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A port was opened and the device answered identity verification.
    Connected {
        /// True when the connection was restored by the reconnect loop
        /// rather than an explicit `connect` call.
        reconnected: bool,
    },

    /// The device was closed deliberately.
    Closed,

    /// The link failed mid-operation. Emitted at most once per port
    /// instance.
    Lost,

    /// One reconnect attempt failed; the loop will try again.
    ReconnectFailed,
}

pub type EventSender = broadcast::Sender<DeviceEvent>;
pub type EventReceiver = broadcast::Receiver<DeviceEvent>;

pub(crate) fn event_channel() -> EventSender {
    broadcast::channel(EVENT_CAPACITY).0
}
