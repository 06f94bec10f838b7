//! In-memory transport for tests.
//!
//! [`MockPort`] answers commands from a stub table and records every call
//! so tests can assert on exact traffic. Failure injection covers the
//! paths the driver must handle: write errors, read timeouts and refused
//! opens.

// Lock poisoning here means a test already panicked.
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Port, PortCandidate, PortProvider};

#[derive(Default)]
struct MockPortState {
    stubs: Mutex<HashMap<String, String>>,
    last_command: Mutex<Option<String>>,
    call_log: Mutex<Vec<String>>,
    fail_next_write: AtomicBool,
    fail_next_read: AtomicBool,
    closed: AtomicBool,
    busy: AtomicBool,
    overlap_detected: AtomicBool,
    latency: Mutex<Duration>,
}

/// A scripted [`Port`] that replies to known commands.
///
/// Clones share state, so a test can keep a handle for assertions while
/// the driver owns the boxed copy.
#[derive(Clone, Default)]
pub struct MockPort {
    shared: Arc<MockPortState>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a response frame (terminator added on read) for a command
    /// frame (terminator stripped on write).
    pub fn stub(&self, command: &str, response: &str) {
        self.shared
            .stubs
            .lock()
            .unwrap()
            .insert(command.to_string(), response.to_string());
    }

    /// Delay each read by `latency`, simulating a slow device.
    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock().unwrap() = latency;
    }

    /// Make the next `write_all` fail with a broken pipe.
    pub fn fail_next_write(&self) {
        self.shared.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Make the next `read_until` fail with a timeout.
    pub fn fail_next_read(&self) {
        self.shared.fail_next_read.store(true, Ordering::SeqCst);
    }

    /// Every write and read issued so far, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.shared.call_log.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// True if a second exchange started before the previous one finished.
    pub fn overlap_detected(&self) -> bool {
        self.shared.overlap_detected.load(Ordering::SeqCst)
    }

    fn log(&self, entry: String) {
        self.shared.call_log.lock().unwrap().push(entry);
    }

    fn reopen(&self) {
        self.shared.closed.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Port for MockPort {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        if self.shared.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure"));
        }
        if self.shared.busy.swap(true, Ordering::SeqCst) {
            self.shared.overlap_detected.store(true, Ordering::SeqCst);
        }

        let command = String::from_utf8_lossy(bytes)
            .trim_end_matches('\r')
            .to_string();
        self.log(format!("write {}", command));
        *self.shared.last_command.lock().unwrap() = Some(command);
        Ok(())
    }

    async fn read_until(&mut self, delimiter: u8, timeout: Duration) -> io::Result<Vec<u8>> {
        let latency = *self.shared.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = (|| {
            if self.shared.fail_next_read.swap(false, Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "injected read failure"));
            }
            let command = self
                .shared
                .last_command
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no command pending"))?;
            let response = self.shared.stubs.lock().unwrap().get(&command).cloned();
            match response {
                Some(response) => {
                    self.log(format!("read {}", response));
                    let mut bytes = response.into_bytes();
                    bytes.push(delimiter);
                    Ok(bytes)
                }
                None => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no stub for command {:?} within {:?}", command, timeout),
                )),
            }
        })();

        self.shared.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.log("close".to_string());
    }
}

#[derive(Default)]
struct MockProviderState {
    ports: Mutex<HashMap<String, MockPort>>,
    order: Mutex<Vec<String>>,
    fail_opens: AtomicUsize,
    open_log: Mutex<Vec<String>>,
}

/// A [`PortProvider`] serving [`MockPort`]s by address.
#[derive(Clone, Default)]
pub struct MockProvider {
    shared: Arc<MockProviderState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a port under `address`. Listing order follows insertion.
    pub fn add_port(&self, address: &str, port: MockPort) {
        self.shared
            .ports
            .lock()
            .unwrap()
            .insert(address.to_string(), port);
        self.shared.order.lock().unwrap().push(address.to_string());
    }

    /// Refuse the next `n` open attempts.
    pub fn fail_next_opens(&self, n: usize) {
        self.shared.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Addresses passed to `open` so far, successful or not.
    pub fn open_log(&self) -> Vec<String> {
        self.shared.open_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl PortProvider for MockProvider {
    async fn open(&self, address: &str) -> io::Result<Box<dyn Port>> {
        self.shared
            .open_log
            .lock()
            .unwrap()
            .push(address.to_string());

        let remaining = self.shared.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.shared.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "injected open failure"));
        }

        let port = self
            .shared
            .ports
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such port"))?;
        port.reopen();
        Ok(Box::new(port))
    }

    fn list(&self, _all: bool) -> Vec<PortCandidate> {
        self.shared
            .order
            .lock()
            .unwrap()
            .iter()
            .map(|address| PortCandidate {
                address: address.clone(),
                serial_number: None,
            })
            .collect()
    }
}
