//! Client side of a channel.
//!
//! A [`ClientTransportSink`] talks to one server channel. Each call takes an
//! idle connection from the destination's pool, or negotiates a new one, and
//! sends the request. Sending is retried when the body can be rewound; reading
//! the reply is not. A connection is returned to the pool only after a
//! complete transaction, and any failure flushes the whole pool since the
//! server side may be out of step.

use std::future::Future;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::config::ChannelConfig;
use crate::connection::DuplexConnection;
use crate::connector::ClientConnector;
use crate::envelope::TransportHeaders;
use crate::error::{ChannelError, TransportIoError};
use crate::fault::{FaultAction, FaultInjector, FaultPoint};
use crate::names::ObjectNames;
use crate::pool::{ConnectionPool, PoolRegistry};

/// A readable, seekable request body.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// The payload of an outgoing request.
pub enum RequestBody {
    /// Rewound to its starting position before every retry.
    Seekable(Box<dyn ReadSeek>),
    /// Consumed by the first attempt, so a failed send is final.
    Stream(Box<dyn Read + Send>),
}

impl RequestBody {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        RequestBody::Seekable(Box::new(Cursor::new(bytes.into())))
    }

    pub fn seekable(body: impl Read + Seek + Send + 'static) -> Self {
        RequestBody::Seekable(Box::new(body))
    }

    pub fn stream(body: impl Read + Send + 'static) -> Self {
        RequestBody::Stream(Box::new(body))
    }

    pub fn is_rewindable(&self) -> bool {
        matches!(self, RequestBody::Seekable(_))
    }

    fn reader(&mut self) -> &mut dyn Read {
        match self {
            RequestBody::Seekable(body) => &mut **body,
            RequestBody::Stream(body) => &mut **body,
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        RequestBody::from_bytes(Bytes::new())
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Seekable(_) => f.write_str("RequestBody::Seekable"),
            RequestBody::Stream(_) => f.write_str("RequestBody::Stream"),
        }
    }
}

/// A request ready to be sent.
#[derive(Debug, Default)]
pub struct OutgoingRequest {
    /// Written into the envelope's destination field.
    pub destination: String,
    pub headers: TransportHeaders,
    pub body: RequestBody,
}

impl OutgoingRequest {
    pub fn new(destination: impl Into<String>, body: RequestBody) -> Self {
        Self {
            destination: destination.into(),
            headers: TransportHeaders::new(),
            body,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }
}

/// A decoded reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub headers: TransportHeaders,
    pub body: Bytes,
}

/// Sends requests to one server channel.
#[derive(Debug, Clone)]
pub struct ClientTransportSink {
    url: String,
    channel: String,
    object_uri: Option<String>,
    names: ObjectNames,
    config: Arc<ChannelConfig>,
    pool: Arc<ConnectionPool>,
    faults: Arc<FaultInjector>,
}

impl ClientTransportSink {
    /// A sink for `url`, pooling its connections in `registry`.
    pub fn new(
        url: &str,
        config: Arc<ChannelConfig>,
        registry: &PoolRegistry,
        faults: Arc<FaultInjector>,
    ) -> Result<Self, ChannelError> {
        let (channel, object_uri) =
            crate::url::parse(url).ok_or_else(|| ChannelError::InvalidUrl(url.to_owned()))?;
        if channel.is_empty() {
            return Err(ChannelError::InvalidUrl(url.to_owned()));
        }
        Ok(Self {
            url: url.to_owned(),
            names: ObjectNames::new(config.namespace.clone()),
            pool: registry.lookup(&channel),
            channel,
            object_uri,
            config,
            faults,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    pub fn object_uri(&self) -> Option<&str> {
        self.object_uri.as_deref()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// A request addressed to this sink's object.
    pub fn new_request(&self, body: RequestBody) -> OutgoingRequest {
        OutgoingRequest::new(self.object_uri.as_deref().unwrap_or(&self.url), body)
    }

    /// Send a request and wait for its reply.
    pub fn call(&self, request: &mut OutgoingRequest) -> Result<Response, TransportIoError> {
        let connection = self.send_with_retry(request)?;
        self.receive(connection)
    }

    /// Send a request that expects no reply.
    pub fn call_one_way(&self, request: &mut OutgoingRequest) -> Result<(), TransportIoError> {
        let connection = self.send_with_retry(request)?;
        self.pool.return_to_pool(connection);
        Ok(())
    }

    /// Send a request now and hand the reply, or the failure to read it, to
    /// `continuation` on a background thread.
    pub fn call_async<F>(
        &self,
        request: &mut OutgoingRequest,
        continuation: F,
    ) -> Result<(), TransportIoError>
    where
        F: FnOnce(Result<Response, TransportIoError>) + Send + 'static,
    {
        let connection = self.send_with_retry(request)?;
        let sink = self.clone();
        std::thread::Builder::new()
            .name("shm-reply".into())
            .spawn(move || continuation(sink.receive(connection)))
            .map_err(|e| TransportIoError::os("failed to spawn reply thread", &e))?;
        Ok(())
    }

    /// Like [`call_async`](Self::call_async), but the reply arrives through
    /// a [`PendingReply`].
    pub fn call_deferred(
        &self,
        request: &mut OutgoingRequest,
    ) -> Result<PendingReply, TransportIoError> {
        let (tx, rx) = oneshot::channel();
        self.call_async(request, move |result| {
            let _ = tx.send(result);
        })?;
        Ok(PendingReply { rx })
    }

    /// Transfer `request` over a pooled or fresh connection.
    ///
    /// Rewindable bodies get up to `retry_count` attempts, each starting
    /// from the body's position at the first attempt. Every failure closes
    /// the connection and flushes the pool.
    pub fn send_with_retry(
        &self,
        request: &mut OutgoingRequest,
    ) -> Result<DuplexConnection, TransportIoError> {
        let attempts = if request.body.is_rewindable() {
            self.config.retry_count.max(1)
        } else {
            1
        };
        let start = match &mut request.body {
            RequestBody::Seekable(body) => Some(body.stream_position().map_err(|e| {
                TransportIoError::os("failed to record request body position", &e)
            })?),
            RequestBody::Stream(_) => None,
        };

        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                if let (Some(position), RequestBody::Seekable(body)) = (start, &mut request.body) {
                    body.seek(SeekFrom::Start(position)).map_err(|e| {
                        TransportIoError::os("failed to rewind request body", &e)
                    })?;
                }
            }
            match self.try_send(request) {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    tracing::warn!(
                        channel = %self.channel,
                        attempt,
                        attempts,
                        error = %e,
                        "send failed"
                    );
                    self.pool.close_all();
                    last_error = Some(e);
                }
            }
        }

        let error = TransportIoError::new(format!(
            "sending to {} failed after {attempts} attempt(s)",
            self.url
        ));
        Err(match last_error {
            Some(cause) => error.with_cause(cause),
            None => error,
        })
    }

    fn try_send(&self, request: &mut OutgoingRequest) -> Result<DuplexConnection, TransportIoError> {
        let connection = self.acquire_connection()?;
        let mut writer = connection.begin_write_message();
        writer
            .write_headers(&request.destination, &request.headers)
            .map_err(|e| TransportIoError::os("failed to encode request headers", &e))?;
        writer
            .write_body_from(request.body.reader())
            .map_err(|e| TransportIoError::os("failed to read request body", &e))?;
        if self.faults.check(FaultPoint::Send) == FaultAction::Fail {
            return Err(TransportIoError::new(format!(
                "injected send fault on {}",
                connection.name()
            )));
        }
        connection.end_write_message(writer)?;
        Ok(connection)
    }

    fn acquire_connection(&self) -> Result<DuplexConnection, TransportIoError> {
        if let Some(connection) = self.pool.obtain() {
            tracing::trace!(name = %connection.name(), "reusing pooled connection");
            return Ok(connection);
        }
        let connector = ClientConnector::open(&self.names, &self.channel)?;
        let name = connector.connect(&self.config)?;
        DuplexConnection::connect(&self.names, &name, &self.config)
    }

    /// Read the reply to a request just sent on `connection`.
    fn receive(&self, connection: DuplexConnection) -> Result<Response, TransportIoError> {
        match self.read_reply(&connection) {
            Ok(response) => {
                self.pool.return_to_pool(connection);
                Ok(response)
            }
            Err(e) => {
                tracing::debug!(channel = %self.channel, error = %e, "reading reply failed");
                drop(connection);
                self.pool.close_all();
                Err(e)
            }
        }
    }

    fn read_reply(&self, connection: &DuplexConnection) -> Result<Response, TransportIoError> {
        if self.faults.check(FaultPoint::Reply) == FaultAction::Fail {
            return Err(TransportIoError::new(format!(
                "injected reply fault on {}",
                connection.name()
            )));
        }
        let mut reader = connection.begin_read_message()?.ok_or_else(|| {
            TransportIoError::new(format!(
                "no reply on {}: the server went away or did not answer",
                connection.name()
            ))
        })?;
        let malformed = |e| TransportIoError::new(format!("malformed reply: {e}"));
        let headers = reader.read_headers().map_err(malformed)?;
        let body = reader.read_body().map_err(malformed)?;
        Ok(Response { headers, body })
    }
}

/// The eventual reply of [`ClientTransportSink::call_deferred`].
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Response, TransportIoError>>,
}

impl PendingReply {
    /// Block the current thread until the reply arrives.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> Result<Response, TransportIoError> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(abandoned()))
    }
}

fn abandoned() -> TransportIoError {
    TransportIoError::new("reply thread ended without a result")
}

impl Future for PendingReply {
    type Output = Result<Response, TransportIoError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(abandoned())),
            Poll::Pending => Poll::Pending,
        }
    }
}
