//! Channel configuration.

use std::time::Duration;

use crate::error::ConfigError;
use crate::layout::{DEFAULT_SECTION_SIZE, MIN_SECTION_SIZE};

/// Default bound on write-ready and rendezvous confirm waits.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default idle time after which a pooled connection is evicted.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);

pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Configuration shared by both ends of a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Prefix of every named OS object this channel creates or opens.
    pub namespace: String,
    /// Total size of a duplex segment, split evenly between the two
    /// directions. Only the creating side uses it; joiners adopt the
    /// existing size.
    pub section_size: usize,
    /// Bound on write-ready waits and on the rendezvous confirm wait.
    pub wait_timeout: Duration,
    /// Bound on acquiring the rendezvous mutex.
    pub connect_mutex_timeout: Duration,
    /// How long the listener waits for a request before looping.
    pub accept_timeout: Duration,
    /// Bound on a client waiting for a reply.
    pub reply_timeout: Duration,
    /// Bound on a server worker waiting for the next request. Kept well
    /// above `reply_timeout` so workers outlive a client's retry window.
    pub server_idle_timeout: Duration,
    /// Idle time after which pooled connections are evicted.
    pub stale_after: Duration,
    /// Send attempts for a rewindable request body.
    pub retry_count: u32,
    /// Display name of the channel.
    pub channel_name: String,
    pub priority: i32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            namespace: "shmchannel".to_owned(),
            section_size: DEFAULT_SECTION_SIZE,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            connect_mutex_timeout: DEFAULT_WAIT_TIMEOUT * 3,
            accept_timeout: DEFAULT_WAIT_TIMEOUT,
            reply_timeout: DEFAULT_STALE_AFTER,
            server_idle_timeout: DEFAULT_STALE_AFTER * 3,
            stale_after: DEFAULT_STALE_AFTER,
            retry_count: DEFAULT_RETRY_COUNT,
            channel_name: "shm".to_owned(),
            priority: 1,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        if self.namespace.contains('/') {
            return Err(ConfigError::NamespaceHasSlash);
        }
        if self.section_size % 2 != 0 {
            return Err(ConfigError::SectionSizeOdd(self.section_size));
        }
        if self.section_size < MIN_SECTION_SIZE {
            return Err(ConfigError::SectionTooSmall(self.section_size));
        }
        if self.retry_count == 0 {
            return Err(ConfigError::ZeroRetryCount);
        }
        Ok(())
    }
}
