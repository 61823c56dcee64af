//! Rendezvous: negotiating the name of a private connection.
//!
//! A server publishes a small well-known segment with a request signal, a
//! confirm signal and a mutex. A client takes the mutex, raises the request,
//! and waits for the server to write a fresh connection name and raise the
//! confirmation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use shm_primitives::{NamedMutex, Segment, Signal, Wait};

use crate::config::ChannelConfig;
use crate::error::{ChannelError, TransportIoError};
use crate::layout::{CONNECTOR_SECTION_SIZE, MAX_NAME_UNITS};
use crate::names::ObjectNames;
use crate::shutdown::ShutdownSignal;

/// Pause between rendezvous rounds that returned no name.
const EMPTY_NAME_BACKOFF: Duration = Duration::from_millis(10);

fn object_error(action: &str, object: &str, err: std::io::Error) -> TransportIoError {
    TransportIoError::os(format!("failed to {action} {object}"), &err)
}

/// Server end of a rendezvous.
#[derive(Debug)]
pub struct ServerConnector {
    channel: String,
    section: Segment,
    request: Signal,
    confirm: Signal,
    _mutex: NamedMutex,
    pending: AtomicBool,
}

impl ServerConnector {
    /// Publish the rendezvous objects for `channel`.
    ///
    /// Leftovers from a server that died without cleaning up are removed
    /// first; the caller must hold the channel's listen mutex.
    pub fn new(names: &ObjectNames, channel: &str) -> Result<Self, TransportIoError> {
        for object in names.connector_objects(channel) {
            if Segment::remove(&object).map_err(|e| object_error("remove", &object, e))? {
                tracing::debug!(%object, "removed leftover rendezvous object");
            }
        }

        let section_name = names.connector_section(channel);
        let section = Segment::create(&section_name, CONNECTOR_SECTION_SIZE)
            .map_err(|e| object_error("create", &section_name, e))?;
        let request_name = names.connector_request(channel);
        let request = Signal::create(&request_name, false)
            .map_err(|e| object_error("create", &request_name, e))?;
        let confirm_name = names.connector_confirm(channel);
        let confirm = Signal::create(&confirm_name, false)
            .map_err(|e| object_error("create", &confirm_name, e))?;
        let mutex_name = names.connector_mutex(channel);
        let mutex = NamedMutex::create(&mutex_name, false)
            .map_err(|e| object_error("create", &mutex_name, e))?;

        Ok(Self {
            channel: channel.to_owned(),
            section,
            request,
            confirm,
            _mutex: mutex,
            pending: AtomicBool::new(false),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether a request was accepted but not yet confirmed.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait for a client request. `Ok(false)` if `shutdown` was raised.
    pub fn wait_for_connect(
        &self,
        shutdown: &ShutdownSignal,
        timeout: Duration,
    ) -> Result<bool, ChannelError> {
        if self.is_pending() {
            return Err(ChannelError::RequestPending);
        }
        match self.request.wait_or(timeout, || shutdown.is_raised()) {
            Ok(Wait::Signaled) => {
                self.pending.store(true, Ordering::Release);
                Ok(true)
            }
            Ok(Wait::Cancelled) => Ok(false),
            Ok(Wait::TimedOut) => Err(TransportIoError::timeout(format!(
                "no connection request on {} within {timeout:?}",
                self.channel
            ))
            .into()),
            Err(e) => Err(TransportIoError::os(
                format!("waiting for connection requests on {} failed", self.channel),
                &e,
            )
            .into()),
        }
    }

    /// Hand `name` to the waiting client.
    pub fn confirm_connect(&self, name: &str) -> Result<(), ChannelError> {
        if !self.is_pending() {
            return Err(ChannelError::NoRequestPending);
        }
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() >= MAX_NAME_UNITS {
            return Err(TransportIoError::new(format!(
                "connection name of {} UTF-16 units exceeds the limit of {}",
                units.len(),
                MAX_NAME_UNITS - 1
            ))
            .into());
        }
        let bytes: Vec<u8> = units
            .iter()
            .chain(std::iter::once(&0))
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        self.section.write_at(0, &bytes);
        self.pending.store(false, Ordering::Release);
        self.confirm.set();
        Ok(())
    }
}

impl Drop for ServerConnector {
    fn drop(&mut self) {
        if self.is_pending() {
            // An empty name sends the client back to retry.
            let _ = self.confirm_connect("");
        }
    }
}

/// Client end of a rendezvous.
#[derive(Debug)]
pub struct ClientConnector {
    channel: String,
    section: Segment,
    request: Signal,
    confirm: Signal,
    mutex: NamedMutex,
}

impl ClientConnector {
    /// Open the rendezvous objects of a listening channel.
    pub fn open(names: &ObjectNames, channel: &str) -> Result<Self, TransportIoError> {
        let section_name = names.connector_section(channel);
        let section =
            Segment::open(&section_name).map_err(|e| object_error("open", &section_name, e))?;
        if section.len() < CONNECTOR_SECTION_SIZE {
            return Err(TransportIoError::new(format!(
                "{section_name} is too small for a rendezvous"
            )));
        }
        let request_name = names.connector_request(channel);
        let request =
            Signal::open(&request_name).map_err(|e| object_error("open", &request_name, e))?;
        let confirm_name = names.connector_confirm(channel);
        let confirm =
            Signal::open(&confirm_name).map_err(|e| object_error("open", &confirm_name, e))?;
        let mutex_name = names.connector_mutex(channel);
        let mutex =
            NamedMutex::open(&mutex_name).map_err(|e| object_error("open", &mutex_name, e))?;
        Ok(Self {
            channel: channel.to_owned(),
            section,
            request,
            confirm,
            mutex,
        })
    }

    /// Negotiate a connection name, retrying while the server answers with
    /// an empty one.
    ///
    /// Empty answers are retried for at most `wait_timeout`; a server that
    /// keeps failing to create connections yields a timeout error.
    pub fn connect(&self, config: &ChannelConfig) -> Result<String, TransportIoError> {
        let deadline = Instant::now() + config.wait_timeout;
        let mut rounds = 0u32;
        loop {
            let name = self.request_name(config)?;
            rounds += 1;
            if !name.is_empty() {
                return Ok(name);
            }
            if Instant::now() >= deadline {
                return Err(TransportIoError::timeout(format!(
                    "{} offered no connection in {rounds} rendezvous round(s) within {:?}",
                    self.channel, config.wait_timeout
                )));
            }
            tracing::debug!(channel = %self.channel, rounds, "rendezvous returned no name, retrying");
            std::thread::sleep(EMPTY_NAME_BACKOFF);
        }
    }

    /// One rendezvous round. An empty name means the server withdrew.
    pub fn request_name(&self, config: &ChannelConfig) -> Result<String, TransportIoError> {
        let guard = self
            .mutex
            .lock(config.connect_mutex_timeout)
            .map_err(|e| {
                TransportIoError::os(format!("locking rendezvous of {} failed", self.channel), &e)
            })?
            .ok_or_else(|| {
                TransportIoError::timeout(format!(
                    "timed out waiting for the rendezvous of {}",
                    self.channel
                ))
            })?;
        if guard.was_abandoned() {
            tracing::debug!(channel = %self.channel, "rendezvous mutex was abandoned");
        }

        // A client that gave up earlier may have left a confirmation behind.
        self.confirm.reset();
        self.request.set();
        match self.confirm.wait(config.wait_timeout) {
            Ok(true) => {}
            Ok(false) => {
                // If the server already took the request, its late
                // confirmation answers the next client. The connection made
                // for that client's own request is never claimed and idles
                // out on the server.
                self.request.reset();
                tracing::trace!(channel = %self.channel, "withdrew unconfirmed rendezvous request");
                return Err(TransportIoError::timeout(format!(
                    "{} did not confirm the connection within {:?}",
                    self.channel, config.wait_timeout
                )));
            }
            Err(e) => {
                return Err(TransportIoError::os(
                    format!("waiting for the rendezvous of {} failed", self.channel),
                    &e,
                ));
            }
        }
        self.read_name()
    }

    fn read_name(&self) -> Result<String, TransportIoError> {
        let mut raw = [0u8; CONNECTOR_SECTION_SIZE];
        self.section.read_at(0, &mut raw);
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take(MAX_NAME_UNITS)
            .take_while(|unit| *unit != 0)
            .collect();
        String::from_utf16(&units).map_err(|_| {
            TransportIoError::new(format!("{} published an invalid name", self.channel))
        })
    }
}
