//! Server side of a channel.
//!
//! `start_listening` takes the section's listen mutex, publishes the
//! rendezvous objects and starts a listener thread. Every accepted
//! rendezvous yields a new [`DuplexConnection`] that is moved into its own
//! worker thread, which reads requests, hands them to the [`Dispatch`] and
//! writes replies until the client goes quiet or the server stops.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use shm_primitives::{CANCEL_POLL_INTERVAL, NamedMutex, TryAcquire};

use crate::config::ChannelConfig;
use crate::connection::DuplexConnection;
use crate::connector::ServerConnector;
use crate::dispatch::{Dispatch, Processing, Request, Responder, write_reply};
use crate::envelope::{DecodeError, MessageReader};
use crate::error::{ChannelError, TransportIoError};
use crate::names::ObjectNames;
use crate::shutdown::ShutdownSignal;

/// A server listening on one section name.
pub struct ServerChannel {
    section: String,
    names: ObjectNames,
    config: Arc<ChannelConfig>,
    dispatch: Arc<dyn Dispatch>,
    active: Arc<AtomicUsize>,
    state: Mutex<Option<Listening>>,
}

struct Listening {
    listen_mutex: NamedMutex,
    shutdown: Arc<ShutdownSignal>,
    listener: JoinHandle<ServerConnector>,
}

/// What the listener and its workers share.
#[derive(Clone)]
struct ServeContext {
    names: ObjectNames,
    config: Arc<ChannelConfig>,
    dispatch: Arc<dyn Dispatch>,
    active: Arc<AtomicUsize>,
    shutdown: Arc<ShutdownSignal>,
}

impl ServerChannel {
    /// A server for `section`. Without a name a random one is chosen.
    pub fn new(
        section: Option<&str>,
        config: Arc<ChannelConfig>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        let section = section
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if section.contains('/') {
            return Err(ChannelError::InvalidUrl(crate::url::channel_uri(&section)));
        }
        Ok(Self {
            names: ObjectNames::new(config.namespace.clone()),
            section,
            config,
            dispatch,
            active: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(None),
        })
    }

    /// [`new`](Self::new) followed by [`start_listening`](Self::start_listening).
    pub fn start(
        section: Option<&str>,
        config: Arc<ChannelConfig>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Self, ChannelError> {
        let server = Self::new(section, config, dispatch)?;
        server.start_listening()?;
        Ok(server)
    }

    /// The section (rendezvous) name.
    pub fn name(&self) -> &str {
        &self.section
    }

    pub fn channel_name(&self) -> &str {
        &self.config.channel_name
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    pub fn channel_uri(&self) -> String {
        crate::url::channel_uri(&self.section)
    }

    /// URLs at which `object_uri` is reachable through this server.
    pub fn urls_for_uri(&self, object_uri: &str) -> Vec<String> {
        vec![crate::url::object_url(&self.section, object_uri)]
    }

    pub fn parse(&self, url: &str) -> Option<(String, Option<String>)> {
        crate::url::parse(url)
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Connections currently served by a worker.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Start accepting connections. A no-op if already listening.
    pub fn start_listening(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        let mutex_name = self.names.listen_mutex(&self.section);
        let listen_mutex = NamedMutex::open_or_create(&mutex_name).map_err(|e| {
            TransportIoError::os(format!("failed to open listen mutex {mutex_name}"), &e)
        })?;
        match listen_mutex.try_acquire() {
            TryAcquire::Acquired => {}
            TryAcquire::Abandoned { previous } => {
                tracing::warn!(section = %self.section, previous, "taking over from a dead listener");
            }
            TryAcquire::Busy { owner } => {
                tracing::debug!(section = %self.section, owner, "section already has a listener");
                return Err(ChannelError::AlreadyListening(self.section.clone()));
            }
        }

        let connector = match ServerConnector::new(&self.names, &self.section) {
            Ok(connector) => connector,
            Err(e) => {
                listen_mutex.release();
                return Err(e.into());
            }
        };

        let shutdown = Arc::new(ShutdownSignal::new());
        let context = ServeContext {
            names: self.names.clone(),
            config: self.config.clone(),
            dispatch: self.dispatch.clone(),
            active: self.active.clone(),
            shutdown: shutdown.clone(),
        };
        let listener = match std::thread::Builder::new()
            .name("shm-listener".into())
            .spawn(move || listen(connector, context))
        {
            Ok(handle) => handle,
            Err(e) => {
                listen_mutex.release();
                return Err(TransportIoError::os("failed to spawn listener thread", &e).into());
            }
        };

        tracing::info!(section = %self.section, "listening");
        *state = Some(Listening {
            listen_mutex,
            shutdown,
            listener,
        });
        Ok(())
    }

    /// Stop accepting connections and interrupt every worker. Idempotent.
    pub fn stop_listening(&self) {
        let Some(listening) = self.state.lock().take() else {
            return;
        };
        listening.shutdown.raise();
        match listening.listener.join() {
            Ok(connector) => drop(connector),
            Err(_) => tracing::error!(section = %self.section, "listener thread panicked"),
        }
        listening.listen_mutex.release();
        tracing::info!(section = %self.section, "stopped listening");
    }
}

impl std::fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerChannel")
            .field("section", &self.section)
            .field("listening", &self.is_listening())
            .field("active", &self.active_connections())
            .finish()
    }
}

impl Drop for ServerChannel {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

fn listen(connector: ServerConnector, context: ServeContext) -> ServerConnector {
    loop {
        match connector.wait_for_connect(&context.shutdown, context.config.accept_timeout) {
            Ok(true) => accept(&connector, &context),
            Ok(false) => break,
            Err(ChannelError::Transport(e)) if e.is_timeout() => {
                tracing::trace!(channel = %connector.channel(), "no connection request");
            }
            Err(e) => {
                if context.shutdown.is_raised() {
                    break;
                }
                tracing::warn!(channel = %connector.channel(), error = %e, "waiting for connections failed");
                std::thread::sleep(CANCEL_POLL_INTERVAL);
            }
        }
    }
    tracing::debug!(channel = %connector.channel(), "listener exiting");
    connector
}

/// Create a connection for the pending request and hand it to a worker.
fn accept(connector: &ServerConnector, context: &ServeContext) {
    let name = uuid::Uuid::new_v4().to_string();
    let connection = match DuplexConnection::create(
        &context.names,
        &name,
        &context.config,
        context.shutdown.clone(),
    ) {
        Ok(connection) => Arc::new(connection),
        Err(e) => {
            tracing::warn!(error = %e, "failed to create connection");
            if let Err(e) = connector.confirm_connect("") {
                tracing::warn!(error = %e, "failed to turn the client away");
            }
            return;
        }
    };
    if let Err(e) = connector.confirm_connect(&name) {
        tracing::warn!(%name, error = %e, "failed to confirm connection");
        return;
    }

    let guard = ActiveGuard::new(context.active.clone());
    let dispatch = context.dispatch.clone();
    let spawned = std::thread::Builder::new()
        .name("shm-worker".into())
        .spawn(move || {
            let _guard = guard;
            serve_connection(&connection, dispatch.as_ref());
        });
    if let Err(e) = spawned {
        tracing::error!(%name, error = %e, "failed to spawn connection worker");
    }
}

/// Counts a live worker for as long as it exists.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(active)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn decode_request(reader: &mut MessageReader) -> Result<Request, DecodeError> {
    let headers = reader.read_headers()?;
    let body = reader.read_body()?;
    Ok(Request { headers, body })
}

/// Request/response cycles on one connection until the peer goes quiet,
/// the server shuts down, or the transfer fails.
fn serve_connection(connection: &Arc<DuplexConnection>, dispatch: &dyn Dispatch) {
    tracing::debug!(name = %connection.name(), "worker started");
    loop {
        let mut reader = match connection.begin_read_message() {
            Ok(Some(reader)) => reader,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(name = %connection.name(), error = %e, "read failed");
                break;
            }
        };
        let request = match decode_request(&mut reader) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(name = %connection.name(), error = %e, "malformed request");
                break;
            }
        };
        match dispatch.handle(request, Responder::new(connection.clone())) {
            Processing::Complete(reply) => {
                if let Err(e) = write_reply(connection, &reply) {
                    tracing::debug!(name = %connection.name(), error = %e, "reply failed");
                    break;
                }
            }
            Processing::OneWay | Processing::Async => {}
        }
    }
    connection.close();
    tracing::debug!(name = %connection.name(), "worker finished");
}
