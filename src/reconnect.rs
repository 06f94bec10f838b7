//! Background reconnection after a lost link.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::device::{ConnectionState, Shared};
use crate::events::DeviceEvent;

/// Handle to a running reconnect loop.
pub(crate) struct ReconnectHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ReconnectHandle {
    /// Stop the loop and wait for it to finish.
    pub(crate) async fn cancel(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn a loop that retries the connection until it succeeds or is
/// cancelled. Each failed attempt emits `ReconnectFailed` and waits one
/// interval before the next.
pub(crate) fn spawn(shared: Arc<Shared>) -> ReconnectHandle {
    let (shutdown, mut shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let interval = shared.options().reconnect_interval;

        if shared.options().reconnect_initial_delay {
            tokio::select! {
                _ = sleep(interval) => {}
                _ = &mut shutdown_rx => {
                    debug!("Reconnect loop cancelled before first attempt");
                    return;
                }
            }
        }

        loop {
            // A deliberate close between attempts ends the loop.
            if shared.state().await == ConnectionState::Closed {
                debug!("Reconnect loop stopped by close");
                return;
            }
            match shared.try_connect(true).await {
                Ok(()) => {
                    info!("Reconnect succeeded");
                    return;
                }
                Err(e) => {
                    debug!("Reconnect attempt failed: {}", e);
                    shared.emit(DeviceEvent::ReconnectFailed);
                }
            }

            tokio::select! {
                _ = sleep(interval) => {}
                _ = &mut shutdown_rx => {
                    debug!("Reconnect loop cancelled");
                    return;
                }
            }
        }
    });

    ReconnectHandle { shutdown, task }
}
