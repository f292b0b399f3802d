//! Transport abstraction.
//!
//! The client never blocks on I/O. A [`Transport`] starts connecting,
//! accepts outbound byte buffers and queues [`TransportEvent`]s that the
//! client drains on each tick.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::options::ConnectionOptions;
use crate::protocol::{self, Packet};
use crate::types::ProtocolVersion;

/// Transport type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Plain TCP connection.
    Tcp,
    /// WebSocket connection.
    WebSocket,
}

impl TransportType {
    /// Parse transport type and TLS flag from a URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<(Self, bool)> {
        match scheme.to_lowercase().as_str() {
            "tcp" | "mqtt" | "" => Some((TransportType::Tcp, false)),
            "tls" | "mqtts" | "ssl" => Some((TransportType::Tcp, true)),
            "ws" => Some((TransportType::WebSocket, false)),
            "wss" => Some((TransportType::WebSocket, true)),
            _ => None,
        }
    }

    /// Get default port for this transport type.
    pub fn default_port(&self, tls: bool) -> u16 {
        match (self, tls) {
            (TransportType::Tcp, false) => 1883,
            (TransportType::Tcp, true) => 8883,
            (TransportType::WebSocket, false) => 80,
            (TransportType::WebSocket, true) => 443,
        }
    }
}

/// Connection state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Initial,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    DisconnectedWithError,
}

/// Something that happened on the transport since the last poll.
#[derive(Debug)]
pub enum TransportEvent {
    StateChanged {
        state: TransportState,
        reason: Option<String>,
    },
    /// A decoded inbound packet and its size on the wire.
    Packet { packet: Packet, size: usize },
    Error(Error),
}

/// Byte-stream connection used by the client.
pub trait Transport: Send {
    /// Start connecting. Progress is reported through events.
    fn begin_connect(&mut self, options: &ConnectionOptions, cancel: CancellationToken) -> Result<()>;

    /// Queue bytes for sending.
    fn send(&mut self, bytes: Bytes) -> Result<()>;

    /// Close the connection after queued bytes are written.
    fn begin_disconnect(&mut self);

    /// Next pending event, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

/// TCP transport running on a tokio runtime.
pub struct TcpTransport {
    handle: Handle,
    version: ProtocolVersion,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    abort_connect: CancellationToken,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Create a transport on the current tokio runtime.
    pub fn new(version: ProtocolVersion) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::InvalidState(format!("no tokio runtime: {}", e)))?;
        Ok(Self::with_handle(handle, version))
    }

    pub fn with_handle(handle: Handle, version: ProtocolVersion) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            handle,
            version,
            events_tx,
            events_rx,
            outbound: None,
            abort_connect: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn emit_state(&self, state: TransportState, reason: Option<String>) {
        let _ = self
            .events_tx
            .send(TransportEvent::StateChanged { state, reason });
    }
}

impl Transport for TcpTransport {
    fn begin_connect(&mut self, options: &ConnectionOptions, cancel: CancellationToken) -> Result<()> {
        if options.transport != TransportType::Tcp {
            return Err(Error::InvalidArgument(format!(
                "{:?} is not supported by the TCP transport",
                options.transport
            )));
        }
        if options.use_tls {
            return Err(Error::InvalidArgument(
                "TLS is not supported by the TCP transport".to_string(),
            ));
        }
        if self.outbound.is_some() {
            return Err(Error::InvalidState("transport already started".to_string()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.outbound = Some(out_tx);
        self.emit_state(TransportState::Connecting, None);

        let addr = options.addr();
        let version = self.version;
        let events = self.events_tx.clone();
        let abort = self.abort_connect.clone();
        let shutdown = self.shutdown.clone();
        self.handle.spawn(async move {
            debug!("connecting to {}", addr);
            let stream = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = events.send(TransportEvent::StateChanged {
                        state: TransportState::Disconnected,
                        reason: Some("connect cancelled".to_string()),
                    });
                    return;
                }
                _ = abort.cancelled() => {
                    let _ = events.send(TransportEvent::StateChanged {
                        state: TransportState::Disconnected,
                        reason: None,
                    });
                    return;
                }
                result = TcpStream::connect(&addr) => result,
            };

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("connect to {} failed: {}", addr, e);
                    let _ = events.send(TransportEvent::StateChanged {
                        state: TransportState::DisconnectedWithError,
                        reason: Some(e.to_string()),
                    });
                    return;
                }
            };
            let _ = stream.set_nodelay(true);
            let (reader, writer) = stream.into_split();

            let _ = events.send(TransportEvent::StateChanged {
                state: TransportState::Connected,
                reason: None,
            });
            tokio::spawn(read_loop(reader, version, events.clone(), shutdown.clone()));
            write_loop(writer, out_rx, events, shutdown).await;
        });
        Ok(())
    }

    fn send(&mut self, bytes: Bytes) -> Result<()> {
        let Some(outbound) = &self.outbound else {
            return Err(Error::InvalidState("transport is not connected".to_string()));
        };
        outbound
            .send(bytes)
            .map_err(|_| Error::InvalidState("transport is closed".to_string()))
    }

    fn begin_disconnect(&mut self) {
        if self.outbound.take().is_some() {
            self.emit_state(TransportState::Disconnecting, None);
        }
        self.abort_connect.cancel();
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.try_recv().ok()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.abort_connect.cancel();
        self.shutdown.cancel();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    version: ProtocolVersion,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                let _ = events.send(TransportEvent::StateChanged {
                    state: TransportState::Disconnected,
                    reason: Some("connection closed by peer".to_string()),
                });
                return;
            }
            Ok(n) => trace!("read {} bytes", n),
            Err(e) => {
                let _ = events.send(TransportEvent::StateChanged {
                    state: TransportState::DisconnectedWithError,
                    reason: Some(e.to_string()),
                });
                return;
            }
        }

        loop {
            match protocol::decode(&mut buf, version) {
                Ok(Some((packet, size))) => {
                    if events.send(TransportEvent::Packet { packet, size }).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(e));
                    return;
                }
            }
        }
    }
}

/// Write queued buffers until the sender side is dropped, then close.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = shutdown.cancelled() => return,
            bytes = outbound.recv() => bytes,
        };
        let Some(bytes) = bytes else {
            break;
        };
        if let Err(e) = writer.write_all(&bytes).await {
            let _ = events.send(TransportEvent::StateChanged {
                state: TransportState::DisconnectedWithError,
                reason: Some(e.to_string()),
            });
            shutdown.cancel();
            return;
        }
        trace!("wrote {} bytes", bytes.len());
    }

    let _ = writer.shutdown().await;
    shutdown.cancel();
    let _ = events.send(TransportEvent::StateChanged {
        state: TransportState::Disconnected,
        reason: None,
    });
}
