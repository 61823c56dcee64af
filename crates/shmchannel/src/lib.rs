//! Intra-machine RPC transport over shared memory.
//!
//! A server publishes a rendezvous under a section name. Each client that
//! connects negotiates a private [`DuplexConnection`]: one shared segment
//! split into two transfer blocks plus four named signals that make the two
//! ends take turns. Messages are moved in length-prefixed chunks and carry
//! an envelope of destination, headers and an opaque body.
//!
//! ```text
//!  client thread                           server
//!  -------------                           ------
//!  ClientTransportSink ──rendezvous──▶ listener thread
//!        │                                  │ creates
//!        ▼                                  ▼
//!  DuplexConnection ◀══ shared segment ══▶ DuplexConnection ── worker thread ── Dispatch
//!        │
//!  ConnectionPool (per destination, swept for staleness)
//! ```
//!
//! Addresses have the form `shm://section/object-path`.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod connector;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod fault;
pub mod layout;
pub mod names;
pub mod pool;
pub mod server;
pub mod shutdown;
pub mod url;

pub use channel::ShmChannel;
pub use client::{ClientTransportSink, OutgoingRequest, PendingReply, RequestBody, Response};
pub use config::ChannelConfig;
pub use connection::DuplexConnection;
pub use connector::{ClientConnector, ServerConnector};
pub use dispatch::{Dispatch, Processing, Reply, Request, Responder};
pub use envelope::{DecodeError, MessageReader, MessageWriter, TransportHeaders};
pub use error::{ChannelError, ConfigError, TransportIoError};
pub use fault::{FaultAction, FaultInjector, FaultPoint};
pub use layout::{Side, TransferLayout};
pub use names::ObjectNames;
pub use pool::{ConnectionPool, PoolRegistry};
pub use server::ServerChannel;
pub use shutdown::ShutdownSignal;
