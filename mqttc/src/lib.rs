//! MQTT 3.1.1 / 5.0 client engine with durable sessions.
//!
//! The engine keeps every piece of QoS 1/2 state in a [`Session`] that
//! survives reconnects and process restarts:
//!
//! - **Unacknowledged / queued publishes**: resent with DUP after reconnect
//! - **Received / released packet ids**: exactly-once delivery for QoS 2
//! - **Topic aliases**: the client-side alias mapping (MQTT 5.0)
//!
//! Sessions are stored in an embedded record [`store`] with an AVL index,
//! one directory per host and client id.
//!
//! ## Components
//!
//! - [`Client`]: the protocol engine, driven by [`Client::tick`]
//! - [`SessionRegistry`]: per-host session lookup and persistence
//! - [`Transport`]: the byte pipe under the engine ([`TcpTransport`])
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use giztoy_mqttc::{
//!     Client, ConnectBuilder, ConnectionOptionsBuilder, PublishBuilder, QoS, SubscribeBuilder,
//!     SubscribeTopic,
//! };
//!
//! #[tokio::main]
//! async fn main() -> giztoy_mqttc::Result<()> {
//!     let options = ConnectionOptionsBuilder::new()
//!         .with_tcp("127.0.0.1", 1883)
//!         .build();
//!     let mut client = Client::new(options)?;
//!     client.on_message(|msg| {
//!         println!("{}: {:?}", msg.topic, msg.payload);
//!         Ok(())
//!     });
//!     client.connect(ConnectBuilder::new().with_client_id("device-1"))?;
//!
//!     let mut subscribed = false;
//!     loop {
//!         client.tick();
//!         if client.state() == giztoy_mqttc::ClientState::Connected && !subscribed {
//!             client.begin_subscribe(SubscribeBuilder::from(SubscribeTopic::new("sensors/#")))?;
//!             client.begin_publish(
//!                 PublishBuilder::new("sensors/temp")
//!                     .with_payload("21.5")
//!                     .with_qos(QoS::AtLeastOnce),
//!             )?;
//!             subscribed = true;
//!         }
//!         tokio::time::sleep(Duration::from_millis(10)).await;
//!     }
//! }
//! ```

mod builder;
mod client;
mod error;
mod options;
pub mod protocol;
pub mod session;
pub mod store;
mod subscription;
pub mod topic;
pub mod transport;
mod types;

pub use builder::{
    AuthBuilder, ConnectBuilder, DEFAULT_KEEP_ALIVE, DEFAULT_RECEIVE_MAXIMUM, DisconnectBuilder,
    LastWillBuilder, PublishBuilder, SubscribeBuilder, SubscribeTopic, UnsubscribeBuilder,
};
pub use client::Client;
pub use client::callbacks::{
    ConnectCustomizer, MessageCallback, SubscribeAckCallback, UnsubscribeAckCallback,
};
pub use error::{Error, MqttErrorKind, Result};
pub use options::{
    ConnectionOptions, ConnectionOptionsBuilder, DEFAULT_FLUSH_INTERVAL, DEFAULT_WEBSOCKET_PATH,
};
pub use session::{Session, SessionRegistry, SessionStorage, default_session_root};
pub use store::StoreFileOptions;
pub use transport::{TcpTransport, Transport, TransportEvent, TransportState, TransportType};
pub use types::{ApplicationMessage, ClientState, ProtocolVersion, QoS, ServerOptions};
