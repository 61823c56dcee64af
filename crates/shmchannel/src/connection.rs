//! Duplex connections over one shared segment.
//!
//! A connection moves whole messages in chunks of at most
//! [`TransferLayout::capacity`] bytes. Each direction has a write-ready and a
//! read-ready signal; a side writes its block only after taking its own
//! write-ready signal and hands the block over by raising the peer's
//! read-ready signal, so at most one unacknowledged chunk exists per
//! direction.
//!
//! Server-side waits also watch the server's [`ShutdownSignal`]. Client-side
//! waits watch the liveness mutex held by the server, so a departed or
//! crashed server unblocks the client instead of leaving it hanging.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use shm_primitives::{NamedMutex, Segment, Signal, Wait};

use crate::config::ChannelConfig;
use crate::envelope::{MessageReader, MessageWriter};
use crate::error::TransportIoError;
use crate::layout::{CHUNK_HEADER_SIZE, Side, TransferLayout};
use crate::names::ObjectNames;
use crate::shutdown::ShutdownSignal;

/// Upper bound on what a declared message length may preallocate.
const MAX_PREALLOCATION: usize = 1 << 20;

/// One end of a duplex shared-memory connection.
#[derive(Debug)]
pub struct DuplexConnection {
    name: String,
    side: Side,
    layout: TransferLayout,
    section: Segment,
    server_read: Signal,
    server_write: Signal,
    client_read: Signal,
    client_write: Signal,
    liveness: NamedMutex,
    shutdown: Option<Arc<ShutdownSignal>>,
    write_timeout: Duration,
    read_timeout: Duration,
    write_turn: Mutex<()>,
    read_turn: Mutex<()>,
    last_accessed: Mutex<Instant>,
    closed: AtomicBool,
}

fn object_error(action: &str, object: &str, err: std::io::Error) -> TransportIoError {
    TransportIoError::os(format!("failed to {action} {object}"), &err)
}

impl DuplexConnection {
    /// Create every object of connection `name`. The new handle is the
    /// server end and holds the liveness mutex until closed.
    pub fn create(
        names: &ObjectNames,
        name: &str,
        config: &ChannelConfig,
        shutdown: Arc<ShutdownSignal>,
    ) -> Result<Self, TransportIoError> {
        let layout = TransferLayout::new(config.section_size).ok_or_else(|| {
            TransportIoError::new(format!("unusable section size {}", config.section_size))
        })?;

        let section_name = names.section(name);
        let section = Segment::create(&section_name, layout.section_size())
            .map_err(|e| object_error("create", &section_name, e))?;
        let create_signal = |object: String, set: bool| {
            Signal::create(&object, set).map_err(|e| object_error("create", &object, e))
        };
        let server_read = create_signal(names.server_read_ready(name), false)?;
        let server_write = create_signal(names.server_write_ready(name), true)?;
        let client_read = create_signal(names.client_read_ready(name), false)?;
        let client_write = create_signal(names.client_write_ready(name), true)?;
        let liveness_name = names.liveness(name);
        let liveness = NamedMutex::create(&liveness_name, true)
            .map_err(|e| object_error("create", &liveness_name, e))?;

        tracing::debug!(name, section_size = layout.section_size(), "created duplex connection");
        Ok(Self {
            name: name.to_owned(),
            side: Side::Creator,
            layout,
            section,
            server_read,
            server_write,
            client_read,
            client_write,
            liveness,
            shutdown: Some(shutdown),
            write_timeout: config.wait_timeout,
            read_timeout: config.server_idle_timeout,
            write_turn: Mutex::new(()),
            read_turn: Mutex::new(()),
            last_accessed: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        })
    }

    /// Open the objects of connection `name` created by a server.
    pub fn connect(
        names: &ObjectNames,
        name: &str,
        config: &ChannelConfig,
    ) -> Result<Self, TransportIoError> {
        let section_name = names.section(name);
        let section =
            Segment::open(&section_name).map_err(|e| object_error("open", &section_name, e))?;
        let layout = TransferLayout::new(section.len()).ok_or_else(|| {
            TransportIoError::new(format!(
                "{section_name} has unusable size {}",
                section.len()
            ))
        })?;
        let open_signal = |object: String| {
            Signal::open(&object).map_err(|e| object_error("open", &object, e))
        };
        let server_read = open_signal(names.server_read_ready(name))?;
        let server_write = open_signal(names.server_write_ready(name))?;
        let client_read = open_signal(names.client_read_ready(name))?;
        let client_write = open_signal(names.client_write_ready(name))?;
        let liveness_name = names.liveness(name);
        let liveness =
            NamedMutex::open(&liveness_name).map_err(|e| object_error("open", &liveness_name, e))?;

        tracing::debug!(name, section_size = layout.section_size(), "joined duplex connection");
        Ok(Self {
            name: name.to_owned(),
            side: Side::Joiner,
            layout,
            section,
            server_read,
            server_write,
            client_read,
            client_write,
            liveness,
            shutdown: None,
            write_timeout: config.wait_timeout,
            read_timeout: config.reply_timeout,
            write_turn: Mutex::new(()),
            read_turn: Mutex::new(()),
            last_accessed: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn layout(&self) -> TransferLayout {
        self.layout
    }

    fn own_write_ready(&self) -> &Signal {
        match self.side {
            Side::Creator => &self.server_write,
            Side::Joiner => &self.client_write,
        }
    }

    fn own_read_ready(&self) -> &Signal {
        match self.side {
            Side::Creator => &self.server_read,
            Side::Joiner => &self.client_read,
        }
    }

    fn peer_write_ready(&self) -> &Signal {
        match self.side {
            Side::Creator => &self.client_write,
            Side::Joiner => &self.server_write,
        }
    }

    fn peer_read_ready(&self) -> &Signal {
        match self.side {
            Side::Creator => &self.client_read,
            Side::Joiner => &self.server_read,
        }
    }

    /// Shutdown on the server end, a departed server on the client end.
    fn interrupted(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        match self.side {
            Side::Creator => self.shutdown.as_ref().is_some_and(|s| s.is_raised()),
            Side::Joiner => !self.liveness.is_held(),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportIoError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportIoError::new(format!(
                "connection {} is closed",
                self.name
            )));
        }
        Ok(())
    }

    fn interrupted_error(&self) -> TransportIoError {
        match self.side {
            Side::Creator => {
                TransportIoError::new(format!("connection {} interrupted by shutdown", self.name))
            }
            Side::Joiner => {
                TransportIoError::new(format!("server end of {} has gone away", self.name))
            }
        }
    }

    /// A fresh staging buffer for an outgoing message.
    pub fn begin_write_message(&self) -> MessageWriter {
        MessageWriter::new()
    }

    /// Transfer a staged message to the peer, chunk by chunk.
    pub fn end_write_message(&self, writer: MessageWriter) -> Result<(), TransportIoError> {
        self.ensure_open()?;
        let data = writer.as_bytes();
        if data.len() > u32::MAX as usize {
            return Err(TransportIoError::new(format!(
                "message of {} bytes is too large",
                data.len()
            )));
        }
        if self.interrupted() {
            return Err(self.interrupted_error());
        }

        let _turn = self.write_turn.lock();
        let block = self.layout.write_block(self.side);
        let capacity = self.layout.capacity();
        let mut sent = 0;
        loop {
            match self
                .own_write_ready()
                .wait_or(self.write_timeout, || self.interrupted())
            {
                Ok(Wait::Signaled) => {}
                Ok(Wait::Cancelled) => return Err(self.interrupted_error()),
                Ok(Wait::TimedOut) => {
                    return Err(TransportIoError::timeout(format!(
                        "timed out waiting to write on {}",
                        self.name
                    )));
                }
                Err(e) => {
                    return Err(TransportIoError::os(
                        format!("write wait failed on {}", self.name),
                        &e,
                    ));
                }
            }

            let remaining = data.len() - sent;
            let chunk = remaining.min(capacity);
            self.section
                .write_at(block, &(remaining as u32).to_le_bytes());
            self.section
                .write_at(block + CHUNK_HEADER_SIZE, &data[sent..sent + chunk]);
            self.peer_read_ready().set();
            sent += chunk;
            tracing::trace!(name = %self.name, chunk, remaining, "wrote chunk");

            if sent >= data.len() {
                break;
            }
        }
        self.update_last_accessed();
        Ok(())
    }

    /// Receive the next whole message from the peer.
    ///
    /// `Ok(None)` means the peer is gone: the wait timed out, the server is
    /// shutting down, or the server end released the connection. The server
    /// end releases its liveness mutex in that case.
    pub fn begin_read_message(&self) -> Result<Option<MessageReader>, TransportIoError> {
        self.ensure_open()?;
        let _turn = self.read_turn.lock();
        let block = self.layout.read_block(self.side);
        let capacity = self.layout.capacity();
        let mut message = BytesMut::new();
        let mut total: Option<usize> = None;
        loop {
            match self
                .own_read_ready()
                .wait_or(self.read_timeout, || self.interrupted())
            {
                Ok(Wait::Signaled) => {}
                Ok(outcome) => {
                    tracing::debug!(name = %self.name, ?outcome, "read ended without a message");
                    self.abandon();
                    return Ok(None);
                }
                Err(e) => {
                    return Err(TransportIoError::os(
                        format!("read wait failed on {}", self.name),
                        &e,
                    ));
                }
            }

            let mut header = [0u8; CHUNK_HEADER_SIZE];
            self.section.read_at(block, &mut header);
            let remaining = u32::from_le_bytes(header) as usize;
            let total = *total.get_or_insert_with(|| {
                message.reserve(remaining.min(MAX_PREALLOCATION));
                remaining
            });
            if remaining != total - message.len() {
                return Err(TransportIoError::new(format!(
                    "chunk on {} announces {remaining} remaining bytes, expected {}",
                    self.name,
                    total - message.len()
                )));
            }

            let chunk = remaining.min(capacity);
            let start = message.len();
            message.resize(start + chunk, 0);
            self.section
                .read_at(block + CHUNK_HEADER_SIZE, &mut message[start..]);
            self.peer_write_ready().set();
            tracing::trace!(name = %self.name, chunk, remaining, "read chunk");

            if message.len() >= total {
                break;
            }
        }
        self.update_last_accessed();
        Ok(Some(MessageReader::new(message.freeze())))
    }

    /// Let a waiting client observe that this server end is done.
    fn abandon(&self) {
        if self.side == Side::Creator {
            self.liveness.release();
        }
    }

    pub fn update_last_accessed(&self) {
        *self.last_accessed.lock() = Instant::now();
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_accessed().elapsed()
    }

    /// Idle for longer than `threshold`.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.idle_for() > threshold
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close this end. Idempotent; later transfers fail.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.abandon();
        tracing::debug!(name = %self.name, side = ?self.side, "closed duplex connection");
    }
}

impl Drop for DuplexConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn test_names() -> ObjectNames {
        ObjectNames::new(format!("dc{}", &uuid::Uuid::new_v4().simple().to_string()[..10]))
    }

    fn small_config(section_size: usize) -> ChannelConfig {
        ChannelConfig {
            section_size,
            wait_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(5),
            server_idle_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn pair(section_size: usize) -> (DuplexConnection, DuplexConnection, Arc<ShutdownSignal>) {
        let names = test_names();
        let config = small_config(section_size);
        let shutdown = Arc::new(ShutdownSignal::new());
        let server = DuplexConnection::create(&names, "conn", &config, shutdown.clone()).unwrap();
        let client = DuplexConnection::connect(&names, "conn", &config).unwrap();
        (server, client, shutdown)
    }

    fn send(conn: &DuplexConnection, bytes: &[u8]) {
        let mut writer = conn.begin_write_message();
        writer.write_raw(bytes);
        conn.end_write_message(writer).unwrap();
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_sides_and_layout() {
        let (server, client, _) = pair(64);
        assert_eq!(server.side(), Side::Creator);
        assert_eq!(client.side(), Side::Joiner);
        assert_eq!(client.layout().capacity(), 28);
    }

    #[test]
    fn test_round_trip_sizes() {
        let (server, client, _) = pair(64);
        let capacity = server.layout().capacity();
        let server = Arc::new(server);
        for len in [0, 1, capacity - 1, capacity, capacity + 1, capacity * 7 + 3] {
            let expected = pattern(len);
            let echo = {
                let server = server.clone();
                thread::spawn(move || {
                    let message = server.begin_read_message().unwrap().unwrap();
                    send(&server, &message.into_bytes());
                })
            };
            send(&client, &expected);
            let reply = client.begin_read_message().unwrap().unwrap().into_bytes();
            echo.join().unwrap();
            assert_eq!(&reply[..], &expected[..], "length {len}");
        }
    }

    #[test]
    fn test_both_directions_transfer_at_once() {
        const MESSAGES: usize = 50;
        let (server, client, _) = pair(64);
        let (server, client) = (Arc::new(server), Arc::new(client));

        // Sizes wander between a few bytes and dozens of chunks; each
        // direction has its own seed so the streams differ.
        fn message(seed: usize, i: usize) -> Vec<u8> {
            let len = 7 + (i * 97 + seed * 13) % 1814;
            (0..len).map(|j| (j * 31 + i * 7 + seed) as u8).collect()
        }

        let sender = |conn: Arc<DuplexConnection>, seed: usize| {
            thread::spawn(move || {
                for i in 0..MESSAGES {
                    send(&conn, &message(seed, i));
                }
            })
        };
        let receiver = |conn: Arc<DuplexConnection>, seed: usize| {
            thread::spawn(move || {
                for i in 0..MESSAGES {
                    let received = conn.begin_read_message().unwrap().unwrap().into_bytes();
                    assert_eq!(&received[..], &message(seed, i)[..], "message {i}");
                }
            })
        };

        let threads = [
            sender(client.clone(), 1),
            receiver(server.clone(), 1),
            sender(server.clone(), 2),
            receiver(client.clone(), 2),
        ];
        for handle in threads {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_chunk_header_carries_remaining_length() {
        let (server, client, _) = pair(64);
        let capacity = server.layout().capacity();
        let payload = pattern(capacity * 2 + 5);
        let writer = {
            let payload = payload.clone();
            thread::spawn(move || send(&client, &payload))
        };

        let block = server.layout().read_block(Side::Creator);
        let mut seen = Vec::new();
        let mut received = 0;
        while received < payload.len() {
            assert!(server.server_read.wait(Duration::from_secs(5)).unwrap());
            let mut header = [0u8; 4];
            server.section.read_at(block, &mut header);
            let remaining = u32::from_le_bytes(header) as usize;
            seen.push(remaining);
            received += remaining.min(capacity);
            server.client_write.set();
        }
        writer.join().unwrap();
        assert_eq!(seen, vec![payload.len(), capacity + 5, 5]);
    }

    #[test]
    fn test_server_closing_unblocks_client_read() {
        let (server, client, _) = pair(64);
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(server);
        });
        let start = Instant::now();
        assert!(client.begin_read_message().unwrap().is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
        closer.join().unwrap();
    }

    #[test]
    fn test_shutdown_unblocks_server_read() {
        let (server, client, shutdown) = pair(64);
        let reader = thread::spawn(move || server.begin_read_message().unwrap().is_none());
        thread::sleep(Duration::from_millis(50));
        shutdown.raise();
        assert!(reader.join().unwrap());
        // The server released the connection, so the client sees it gone.
        assert!(client.begin_read_message().unwrap().is_none());
    }

    #[test]
    fn test_write_to_departed_server_fails() {
        let (server, client, _) = pair(64);
        server.close();
        let mut writer = client.begin_write_message();
        writer.write_raw(b"late");
        assert!(client.end_write_message(writer).is_err());
    }

    #[test]
    fn test_closed_connection_rejects_transfers() {
        let (server, client, _) = pair(64);
        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(client.begin_read_message().is_err());
        assert!(client.end_write_message(MessageWriter::new()).is_err());
        drop(server);
    }

    #[test]
    fn test_staleness() {
        let (_server, client, _) = pair(64);
        assert!(!client.is_stale(Duration::from_secs(60)));
        thread::sleep(Duration::from_millis(20));
        assert!(client.is_stale(Duration::from_millis(10)));
        client.update_last_accessed();
        assert!(!client.is_stale(Duration::from_secs(1)));
    }

    #[test]
    fn test_connect_to_missing_connection_fails() {
        let names = test_names();
        let err = DuplexConnection::connect(&names, "nobody", &ChannelConfig::default()).unwrap_err();
        // ENOENT
        assert_eq!(err.os_code(), Some(2));
    }
}
