//! The contract between a server channel and the layer that handles
//! decoded requests.

use std::sync::Arc;

use bytes::Bytes;

use crate::connection::DuplexConnection;
use crate::envelope::TransportHeaders;
use crate::error::TransportIoError;

/// A decoded request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub headers: TransportHeaders,
    pub body: Bytes,
}

impl Request {
    /// The object path the request was addressed to.
    pub fn request_uri(&self) -> Option<&str> {
        self.headers.request_uri()
    }
}

/// A reply to send back over the request's connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub headers: TransportHeaders,
    pub body: Bytes,
}

impl Reply {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            headers: TransportHeaders::new(),
            body: body.into(),
        }
    }

    pub fn with_headers(headers: TransportHeaders, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }
}

/// What the handler did with a request.
#[derive(Debug)]
pub enum Processing {
    /// Reply now.
    Complete(Reply),
    /// No reply is expected.
    OneWay,
    /// The handler kept the [`Responder`] and will reply later.
    Async,
}

/// Handles requests arriving on a server channel.
///
/// Called on the connection's worker thread; the next request on that
/// connection is not read until this returns.
pub trait Dispatch: Send + Sync + 'static {
    fn handle(&self, request: Request, responder: Responder) -> Processing;
}

impl<F> Dispatch for F
where
    F: Fn(Request, Responder) -> Processing + Send + Sync + 'static,
{
    fn handle(&self, request: Request, responder: Responder) -> Processing {
        self(request, responder)
    }
}

/// Sends a deferred reply over the connection a request arrived on.
///
/// Only meaningful when the handler returns [`Processing::Async`].
#[derive(Debug)]
pub struct Responder {
    connection: Arc<DuplexConnection>,
}

impl Responder {
    pub(crate) fn new(connection: Arc<DuplexConnection>) -> Self {
        Self { connection }
    }

    pub fn send(self, reply: Reply) -> Result<(), TransportIoError> {
        write_reply(&self.connection, &reply)
    }
}

/// Encode `reply` and transfer it. The destination field carries the
/// reply's request URI header, if any.
pub(crate) fn write_reply(
    connection: &DuplexConnection,
    reply: &Reply,
) -> Result<(), TransportIoError> {
    let mut writer = connection.begin_write_message();
    writer
        .write_headers(reply.headers.request_uri().unwrap_or(""), &reply.headers)
        .and_then(|()| writer.write_body(&reply.body))
        .map_err(|e| TransportIoError::os("failed to encode reply", &e))?;
    connection.end_write_message(writer)
}
