//! Names of the OS objects behind a channel.

/// Builds object names under one namespace.
///
/// Names have the form `{namespace}_{kind}_{name}`.
#[derive(Debug, Clone)]
pub struct ObjectNames {
    namespace: String,
}

impl ObjectNames {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn object(&self, kind: &str, name: &str) -> String {
        format!("{}_{kind}_{name}", self.namespace)
    }

    pub fn section(&self, connection: &str) -> String {
        self.object("section", connection)
    }

    pub fn server_read_ready(&self, connection: &str) -> String {
        self.object("srvrrd", connection)
    }

    pub fn server_write_ready(&self, connection: &str) -> String {
        self.object("srvrwr", connection)
    }

    pub fn client_read_ready(&self, connection: &str) -> String {
        self.object("clntrd", connection)
    }

    pub fn client_write_ready(&self, connection: &str) -> String {
        self.object("clntwr", connection)
    }

    pub fn liveness(&self, connection: &str) -> String {
        self.object("thrdmutex", connection)
    }

    pub fn connector_section(&self, channel: &str) -> String {
        self.object("connsection", channel)
    }

    pub fn connector_request(&self, channel: &str) -> String {
        self.object("connreq", channel)
    }

    pub fn connector_confirm(&self, channel: &str) -> String {
        self.object("connack", channel)
    }

    pub fn connector_mutex(&self, channel: &str) -> String {
        self.object("connmutex", channel)
    }

    pub fn listen_mutex(&self, channel: &str) -> String {
        self.object("listenmutex", channel)
    }

    /// Every object name a connection uses.
    pub fn connection_objects(&self, connection: &str) -> [String; 6] {
        [
            self.section(connection),
            self.server_read_ready(connection),
            self.server_write_ready(connection),
            self.client_read_ready(connection),
            self.client_write_ready(connection),
            self.liveness(connection),
        ]
    }

    /// Every object name a rendezvous connector uses.
    pub fn connector_objects(&self, channel: &str) -> [String; 4] {
        [
            self.connector_section(channel),
            self.connector_request(channel),
            self.connector_confirm(channel),
            self.connector_mutex(channel),
        ]
    }
}
