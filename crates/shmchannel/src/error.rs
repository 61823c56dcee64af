//! Error types for the channel.

use std::io;

/// A failure of the shared-memory transport itself.
///
/// Raised for wait timeouts and failures, named-object create/open failures,
/// over-long rendezvous names, closed connections, malformed replies and
/// exhausted send retries.
#[derive(Debug)]
pub struct TransportIoError {
    message: String,
    os_code: Option<i32>,
    timed_out: bool,
    cause: Option<Box<TransportIoError>>,
}

impl TransportIoError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            os_code: None,
            timed_out: false,
            cause: None,
        }
    }

    /// A bounded wait that expired.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::new(message)
        }
    }

    /// Wrap an OS-level failure, keeping its error code.
    pub fn os(message: impl Into<String>, err: &io::Error) -> Self {
        let mut error = Self::new(message);
        error.timed_out = err.kind() == io::ErrorKind::TimedOut;
        error.os_code = err.raw_os_error();
        if error.os_code.is_none() {
            error.message = format!("{}: {err}", error.message);
        }
        error
    }

    pub fn with_cause(mut self, cause: TransportIoError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn os_code(&self) -> Option<i32> {
        self.os_code
    }

    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }

    pub fn cause(&self) -> Option<&TransportIoError> {
        self.cause.as_deref()
    }
}

impl std::fmt::Display for TransportIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.os_code {
            write!(f, " ({})", io::Error::from_raw_os_error(code))?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TransportIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Errors from channel-level operations.
#[derive(Debug)]
pub enum ChannelError {
    Transport(TransportIoError),
    /// `wait_for_connect` while a request is still unconfirmed.
    RequestPending,
    /// `confirm_connect` with nothing to confirm.
    NoRequestPending,
    /// Another live listener owns this section.
    AlreadyListening(String),
    /// Listening was requested before a server was registered.
    NotRegistered,
    /// The URL does not belong to this transport.
    InvalidUrl(String),
    InvalidConfig(ConfigError),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Transport(e) => write!(f, "transport error: {e}"),
            ChannelError::RequestPending => {
                write!(f, "a connection request is already pending")
            }
            ChannelError::NoRequestPending => write!(f, "no connection request is pending"),
            ChannelError::AlreadyListening(section) => {
                write!(f, "another server is already listening on {section}")
            }
            ChannelError::NotRegistered => write!(f, "no server channel registered"),
            ChannelError::InvalidUrl(url) => write!(f, "not a shared-memory channel URL: {url}"),
            ChannelError::InvalidConfig(e) => write!(f, "invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Transport(e) => Some(e),
            ChannelError::InvalidConfig(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportIoError> for ChannelError {
    fn from(e: TransportIoError) -> Self {
        ChannelError::Transport(e)
    }
}

impl From<ConfigError> for ChannelError {
    fn from(e: ConfigError) -> Self {
        ChannelError::InvalidConfig(e)
    }
}

/// Rejected [`ChannelConfig`](crate::ChannelConfig) values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    SectionSizeOdd(usize),
    SectionTooSmall(usize),
    ZeroRetryCount,
    EmptyNamespace,
    NamespaceHasSlash,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::SectionSizeOdd(n) => write!(f, "section size {n} is not even"),
            ConfigError::SectionTooSmall(n) => {
                write!(f, "section size {n} leaves no room for payload")
            }
            ConfigError::ZeroRetryCount => write!(f, "retry count must be at least 1"),
            ConfigError::EmptyNamespace => write!(f, "namespace must not be empty"),
            ConfigError::NamespaceHasSlash => write!(f, "namespace must not contain '/'"),
        }
    }
}

impl std::error::Error for ConfigError {}
