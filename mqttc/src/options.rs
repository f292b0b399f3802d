//! Connection options.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::session::{SessionRegistry, SessionStorage, default_session_root};
use crate::store::StoreFileOptions;
use crate::transport::TransportType;
use crate::types::ProtocolVersion;

/// Default WebSocket path.
pub const DEFAULT_WEBSOCKET_PATH: &str = "/mqtt";

/// Default interval between session saves.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Where to connect and how to keep session state.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Broker host name or address.
    pub host: String,
    pub port: u16,
    pub transport: TransportType,
    /// Wrap the transport in TLS.
    pub use_tls: bool,
    /// Request path, WebSocket only.
    pub path: String,
    pub protocol_version: ProtocolVersion,
    /// How often a connected client persists its session.
    pub flush_interval: Duration,
    pub sessions: Arc<SessionRegistry>,
}

impl ConnectionOptions {
    /// `host:port`, as handed to the socket layer.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builder for [`ConnectionOptions`].
///
/// ```
/// use giztoy_mqttc::{ConnectionOptionsBuilder, ProtocolVersion};
///
/// let options = ConnectionOptionsBuilder::new()
///     .with_tcp("broker.local", 1883)
///     .with_protocol_version(ProtocolVersion::V4)
///     .with_memory_sessions()
///     .build();
/// assert_eq!(options.addr(), "broker.local:1883");
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionOptionsBuilder {
    host: String,
    port: u16,
    transport: TransportType,
    use_tls: bool,
    path: String,
    protocol_version: ProtocolVersion,
    flush_interval: Duration,
    storage: Option<SessionStorage>,
    files: StoreFileOptions,
    sessions: Option<Arc<SessionRegistry>>,
}

impl Default for ConnectionOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionOptionsBuilder {
    pub fn new() -> Self {
        Self {
            host: "localhost".to_string(),
            port: TransportType::Tcp.default_port(false),
            transport: TransportType::Tcp,
            use_tls: false,
            path: DEFAULT_WEBSOCKET_PATH.to_string(),
            protocol_version: ProtocolVersion::default(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            storage: None,
            files: StoreFileOptions::default(),
            sessions: None,
        }
    }

    /// Connect over plain TCP.
    pub fn with_tcp(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self.transport = TransportType::Tcp;
        self
    }

    /// Connect over WebSocket.
    pub fn with_websocket(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self.transport = TransportType::WebSocket;
        self
    }

    pub fn with_tls(mut self) -> Self {
        self.use_tls = true;
        self
    }

    /// WebSocket request path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Persist sessions under `root`.
    pub fn with_session_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage = Some(SessionStorage::Disk(root.into()));
        self
    }

    /// Keep sessions in memory only.
    pub fn with_memory_sessions(mut self) -> Self {
        self.storage = Some(SessionStorage::Memory);
        self
    }

    /// Share an existing registry, e.g. between clients of one process.
    pub fn with_session_registry(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// File extensions of the session stores.
    pub fn with_store_files(mut self, files: StoreFileOptions) -> Self {
        self.files = files;
        self
    }

    pub fn build(self) -> ConnectionOptions {
        let sessions = match self.sessions {
            Some(sessions) => sessions,
            None => {
                let storage = self.storage.unwrap_or_else(|| match default_session_root() {
                    Some(root) => SessionStorage::Disk(root),
                    None => {
                        warn!("no cache directory available, sessions are kept in memory");
                        SessionStorage::Memory
                    }
                });
                Arc::new(SessionRegistry::new(storage, self.files))
            }
        };

        ConnectionOptions {
            host: self.host,
            port: self.port,
            transport: self.transport,
            use_tls: self.use_tls,
            path: self.path,
            protocol_version: self.protocol_version,
            flush_interval: self.flush_interval,
            sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectionOptionsBuilder::new().with_memory_sessions().build();
        assert_eq!(options.host, "localhost");
        assert_eq!(options.port, 1883);
        assert_eq!(options.transport, TransportType::Tcp);
        assert!(!options.use_tls);
        assert_eq!(options.path, "/mqtt");
        assert_eq!(options.protocol_version, ProtocolVersion::V5);
        assert_eq!(options.flush_interval, Duration::from_secs(1));
        assert_eq!(options.sessions.storage(), &SessionStorage::Memory);
    }

    #[test]
    fn test_websocket_tls() {
        let options = ConnectionOptionsBuilder::new()
            .with_websocket("broker.local", 443)
            .with_tls()
            .with_path("/ws")
            .with_session_root("/tmp/sessions")
            .build();
        assert_eq!(options.transport, TransportType::WebSocket);
        assert!(options.use_tls);
        assert_eq!(options.path, "/ws");
        assert_eq!(
            options.sessions.storage(),
            &SessionStorage::Disk(PathBuf::from("/tmp/sessions"))
        );
    }

    #[test]
    fn test_shared_registry() {
        let registry = Arc::new(SessionRegistry::memory());
        let a = ConnectionOptionsBuilder::new()
            .with_session_registry(registry.clone())
            .build();
        let b = ConnectionOptionsBuilder::new()
            .with_session_registry(registry.clone())
            .build();
        assert!(Arc::ptr_eq(&a.sessions, &b.sessions));
    }
}
