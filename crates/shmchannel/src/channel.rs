//! The channel as a whole: one optional server plus client sinks.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::ClientTransportSink;
use crate::config::ChannelConfig;
use crate::dispatch::Dispatch;
use crate::error::ChannelError;
use crate::fault::FaultInjector;
use crate::pool::PoolRegistry;
use crate::server::ServerChannel;

/// A shared-memory channel.
///
/// Clients obtained through [`connect`](Self::connect) share this channel's
/// connection pools, which a background sweeper keeps free of stale
/// connections. A server is registered once and then started and stopped
/// independently.
pub struct ShmChannel {
    config: Arc<ChannelConfig>,
    pools: PoolRegistry,
    faults: Arc<FaultInjector>,
    server: Mutex<Option<ServerChannel>>,
}

impl ShmChannel {
    pub fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
        config.validate()?;
        let pools = PoolRegistry::new(config.stale_after);
        Ok(Self {
            config: Arc::new(config),
            pools,
            faults: Arc::new(FaultInjector::new()),
            server: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.channel_name
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    pub fn scheme(&self) -> &'static str {
        crate::url::SCHEME
    }

    /// Register the server side under `section` (a random name if `None`).
    /// Replaces, and stops, any previously registered server. Returns the
    /// section name.
    pub fn register(
        &self,
        section: Option<&str>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<String, ChannelError> {
        let server = ServerChannel::new(section, self.config.clone(), dispatch)?;
        let name = server.name().to_owned();
        let previous = self.server.lock().replace(server);
        drop(previous);
        Ok(name)
    }

    pub fn start_listening(&self) -> Result<(), ChannelError> {
        self.server
            .lock()
            .as_ref()
            .ok_or(ChannelError::NotRegistered)?
            .start_listening()
    }

    pub fn stop_listening(&self) -> Result<(), ChannelError> {
        self.server
            .lock()
            .as_ref()
            .ok_or(ChannelError::NotRegistered)?
            .stop_listening();
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.server
            .lock()
            .as_ref()
            .is_some_and(ServerChannel::is_listening)
    }

    /// Connections served by the registered server's workers.
    pub fn active_connections(&self) -> usize {
        self.server
            .lock()
            .as_ref()
            .map_or(0, ServerChannel::active_connections)
    }

    /// URL of the registered server, if any.
    pub fn channel_uri(&self) -> Option<String> {
        self.server.lock().as_ref().map(ServerChannel::channel_uri)
    }

    pub fn urls_for_uri(&self, object_uri: &str) -> Vec<String> {
        self.server
            .lock()
            .as_ref()
            .map(|server| server.urls_for_uri(object_uri))
            .unwrap_or_default()
    }

    /// A client sink for `url`.
    pub fn connect(&self, url: &str) -> Result<ClientTransportSink, ChannelError> {
        ClientTransportSink::new(url, self.config.clone(), &self.pools, self.faults.clone())
    }

    pub fn parse(&self, url: &str) -> Option<(String, Option<String>)> {
        crate::url::parse(url)
    }

    pub fn fault_injector(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }
}

impl std::fmt::Debug for ShmChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmChannel")
            .field("name", &self.config.channel_name)
            .field("server", &*self.server.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Processing, Request, Responder};

    fn one_way() -> Arc<dyn Dispatch> {
        Arc::new(|_: Request, _: Responder| Processing::OneWay)
    }

    fn channel() -> ShmChannel {
        ShmChannel::new(ChannelConfig {
            namespace: format!("ch{}", &uuid::Uuid::new_v4().simple().to_string()[..10]),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn listening_requires_registration() {
        let channel = channel();
        assert!(matches!(
            channel.start_listening(),
            Err(ChannelError::NotRegistered)
        ));
        assert!(matches!(
            channel.stop_listening(),
            Err(ChannelError::NotRegistered)
        ));
        assert_eq!(channel.channel_uri(), None);
        assert!(channel.urls_for_uri("obj").is_empty());
    }

    #[test]
    fn register_then_listen() {
        let channel = channel();
        let section = channel.register(Some("calc"), one_way()).unwrap();
        assert_eq!(section, "calc");
        assert_eq!(channel.channel_uri().as_deref(), Some("shm://calc"));
        channel.start_listening().unwrap();
        assert!(channel.is_listening());
        channel.stop_listening().unwrap();
        assert!(!channel.is_listening());
    }

    #[test]
    fn connect_checks_scheme() {
        let channel = channel();
        assert_eq!(channel.scheme(), "shm");
        assert!(channel.connect("shm://calc/obj").is_ok());
        assert!(matches!(
            channel.connect("http://calc/obj"),
            Err(ChannelError::InvalidUrl(_))
        ));
        assert_eq!(
            channel.parse("shm://calc/obj"),
            Some(("calc".into(), Some("obj".into())))
        );
    }
}
