//! The protocol engine.
//!
//! A [`Client`] owns one broker connection. It does no I/O and runs no
//! tasks of its own: the application calls [`Client::tick`] regularly, and
//! each tick drains transport events, handles inbound packets, runs
//! keep-alive and flushes buffered outbound packets as one write.

pub mod callbacks;
mod handlers;

use std::cmp;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::builder::{
    AuthBuilder, ConnectBuilder, DisconnectBuilder, PublishBuilder, SubscribeBuilder,
    UnsubscribeBuilder,
};
use crate::error::{Error, MqttErrorKind, Result};
use crate::options::ConnectionOptions;
use crate::protocol::{
    self, AuthPacket, ConnAck, Disconnect, DisconnectProperties, DisconnectReasonCode, Packet,
    Publish, Subscribe, SubscribeProperties, Unsubscribe, UnsubscribeProperties,
};
use crate::session::Session;
use crate::subscription::Subscriptions;
use crate::topic;
use crate::transport::{TcpTransport, Transport, TransportEvent, TransportState};
use crate::types::{ApplicationMessage, ClientState, ProtocolVersion, QoS, ServerOptions};
use callbacks::{Callbacks, guard};

/// MQTT client engine.
///
/// Requests are fire-and-continue: `begin_*` methods queue packets and
/// return, and results arrive through callbacks on a later
/// [`tick`](Self::tick).
pub struct Client {
    options: ConnectionOptions,
    transport: Box<dyn Transport>,
    session: Arc<Session>,
    state: ClientState,
    cancel: CancellationToken,
    connect: ConnectBuilder,
    callbacks: Callbacks,
    subscriptions: Subscriptions,

    server: ServerOptions,
    /// Aliases the server assigned on this connection.
    server_topic_aliases: HashMap<u16, String>,

    packet_id: AtomicU16,
    send_quota: u16,
    send_quota_max: u16,

    buffer_depth: usize,
    outbound: Vec<Packet>,

    keep_alive: u16,
    now: Instant,
    last_packet_sent_at: Instant,
    ping_sent_at: Option<Instant>,
    last_save: Instant,
    disconnect_reason: Option<(DisconnectReasonCode, String)>,
}

impl Client {
    /// Create a client using the TCP transport on the current tokio
    /// runtime.
    pub fn new(options: ConnectionOptions) -> Result<Self> {
        let transport = TcpTransport::new(options.protocol_version)?;
        Self::with_transport(options, Box::new(transport))
    }

    /// Create a client over a custom transport.
    pub fn with_transport(options: ConnectionOptions, transport: Box<dyn Transport>) -> Result<Self> {
        let session = options.sessions.null_session(&options.host)?;
        let now = Instant::now();
        Ok(Self {
            options,
            transport,
            session,
            state: ClientState::Initial,
            cancel: CancellationToken::new(),
            connect: ConnectBuilder::new(),
            callbacks: Callbacks::default(),
            subscriptions: Subscriptions::default(),
            server: ServerOptions::default(),
            server_topic_aliases: HashMap::new(),
            packet_id: AtomicU16::new(0),
            send_quota: 0,
            send_quota_max: 0,
            buffer_depth: 0,
            outbound: Vec::new(),
            keep_alive: 0,
            now,
            last_packet_sent_at: now,
            ping_sent_at: None,
            last_save: now,
            disconnect_reason: None,
        })
    }

    // ---- Callback registration ----

    /// Called once CONNACK accepted the connection.
    pub fn on_connected<F>(&mut self, f: F)
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        self.callbacks.on_connected = Some(Box::new(f));
    }

    /// Called with every CONNACK, accepted or not.
    pub fn on_connack<F>(&mut self, f: F)
    where
        F: FnMut(&ConnAck) -> Result<()> + Send + 'static,
    {
        self.callbacks.on_connack = Some(Box::new(f));
    }

    /// Called with every application message, after the per-topic
    /// callbacks.
    pub fn on_message<F>(&mut self, f: F)
    where
        F: FnMut(&ApplicationMessage) -> Result<()> + Send + 'static,
    {
        self.callbacks.on_message = Some(Box::new(f));
    }

    /// Called with every inbound AUTH packet.
    pub fn on_auth<F>(&mut self, f: F)
    where
        F: FnMut(&AuthPacket) -> Result<()> + Send + 'static,
    {
        self.callbacks.on_auth = Some(Box::new(f));
    }

    pub fn on_error<F>(&mut self, f: F)
    where
        F: FnMut(&Error) -> Result<()> + Send + 'static,
    {
        self.callbacks.on_error = Some(Box::new(f));
    }

    /// Called once when the client reaches `Disconnected`.
    pub fn on_disconnect<F>(&mut self, f: F)
    where
        F: FnMut(DisconnectReasonCode, &str) -> Result<()> + Send + 'static,
    {
        self.callbacks.on_disconnect = Some(Box::new(f));
    }

    pub fn on_state_changed<F>(&mut self, f: F)
    where
        F: FnMut(ClientState, ClientState) -> Result<()> + Send + 'static,
    {
        self.callbacks.on_state_changed = Some(Box::new(f));
    }

    /// Adjust the connect builder right before CONNECT is sent.
    pub fn customize_connect<F>(&mut self, f: F)
    where
        F: FnMut(&mut ConnectBuilder) + Send + 'static,
    {
        self.callbacks.customize_connect = Some(Box::new(f));
    }

    // ---- Accessors ----

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.options.protocol_version
    }

    /// Capabilities from the last CONNACK.
    pub fn server_options(&self) -> &ServerOptions {
        &self.server
    }

    /// QoS 1/2 publishes that may still be sent before queueing starts.
    pub fn send_quota(&self) -> u16 {
        self.send_quota
    }

    /// Negotiated keep-alive in seconds.
    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    /// Token that aborts an unfinished connect when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ---- Connection lifecycle ----

    /// Resolve the session and start connecting.
    pub fn connect(&mut self, builder: ConnectBuilder) -> Result<()> {
        if self.state != ClientState::Initial {
            return Err(Error::InvalidState(format!("connect in state {}", self.state)));
        }

        let host = self.options.host.clone();
        let sessions = self.options.sessions.clone();
        self.session = if let Some(session) = builder.session() {
            session.clone()
        } else if let Some(client_id) = builder.client_id() {
            sessions.get(&host, Some(client_id))?
        } else if builder.wants_null_session() {
            sessions.null_session(&host)?
        } else {
            sessions.get(&host, None)?
        };
        info!(
            "connecting to {} with {} as {:?}",
            self.options.addr(),
            self.options.protocol_version,
            self.session.client_id().unwrap_or("")
        );

        self.connect = builder;
        self.server = ServerOptions::default();
        self.server_topic_aliases.clear();
        self.set_state(ClientState::TransportConnecting);

        if let Err(e) = self.transport.begin_connect(&self.options, self.cancel.clone()) {
            self.fail(DisconnectReasonCode::UnspecifiedError, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Like [`connect`](Self::connect), aborting when `cancel` fires before
    /// CONNACK.
    pub fn connect_with_cancellation(&mut self, builder: ConnectBuilder, cancel: CancellationToken) -> Result<()> {
        self.cancel = cancel;
        self.connect(builder)
    }

    /// Start a graceful disconnect. Queued publishes are dropped.
    pub fn begin_disconnect(&mut self, builder: DisconnectBuilder) -> Result<()> {
        if self.state < ClientState::TransportConnecting || self.state > ClientState::Connected {
            return Ok(());
        }

        self.session.queued().clear()?;
        if self.state == ClientState::Connected {
            self.send_packet(builder.build());
        }
        self.flush_outbound();

        let reason = builder.reason_string().unwrap_or("client disconnected").to_string();
        self.disconnect_reason = Some((builder.reason_code, reason));
        self.set_state(ClientState::Disconnecting);
        self.transport.begin_disconnect();
        Ok(())
    }

    // ---- Requests ----

    /// Publish an application message. Returns its packet id, or 0 for
    /// QoS 0.
    pub fn begin_publish(&mut self, builder: PublishBuilder) -> Result<u16> {
        self.require_connected()?;
        if !topic::is_valid_topic(&builder.topic) {
            return Err(Error::InvalidArgument(format!("invalid topic name {:?}", builder.topic)));
        }
        if builder.retain && !self.server.retain_available {
            return Err(Error::InvalidArgument("server does not support retain".to_string()));
        }

        let qos = if builder.qos > self.server.maximum_qos {
            self.server.maximum_qos
        } else {
            builder.qos
        };
        if qos != builder.qos {
            debug!("downgrading QoS {:?} to {:?} for {}", builder.qos, qos, builder.topic);
        }

        let mut topic = builder.topic.clone();
        let mut properties = None;
        if self.options.protocol_version == ProtocolVersion::V5 {
            properties = builder.properties();
            if let Some(alias) = self.outbound_alias(&builder, &mut topic)? {
                properties.get_or_insert_with(Default::default).topic_alias = Some(alias);
            }
        }

        let mut publish = Publish::new(topic, qos, builder.payload.clone(), properties);
        publish.retain = builder.retain;

        if qos == QoS::AtMostOnce {
            self.send_packet(Packet::Publish(publish));
            return Ok(0);
        }

        let packet_id = self.next_packet_id()?;
        publish.pkid = packet_id;
        if self.send_quota == 0 {
            debug!("send quota exhausted, queueing packet {}", packet_id);
            self.session.queued().add(packet_id, &publish)?;
        } else {
            self.send_publish_packet(packet_id, publish)?;
        }
        Ok(packet_id)
    }

    /// Pick the topic alias for an outbound publish. A topic whose alias
    /// the server already knows is sent as an empty name.
    fn outbound_alias(&mut self, builder: &PublishBuilder, topic: &mut String) -> Result<Option<u16>> {
        let maximum = self.server.topic_alias_maximum;
        let aliases = self.session.topic_aliases();

        if let Some(alias) = builder.topic_alias {
            if alias == 0 || alias > maximum {
                return Err(Error::InvalidArgument(format!(
                    "topic alias {} outside 1..={}",
                    alias, maximum
                )));
            }
            aliases.set(alias, topic)?;
            aliases.set_sent(alias, true);
            return Ok(Some(alias));
        }

        let Some((alias, sent)) = aliases.find_by_topic(topic)? else {
            return Ok(None);
        };
        if alias == 0 || alias > maximum {
            return Ok(None);
        }
        if sent {
            topic.clear();
        } else {
            aliases.set_sent(alias, true);
        }
        Ok(Some(alias))
    }

    /// Subscribe to one or more topic filters. Returns the packet id.
    pub fn begin_subscribe(&mut self, builder: SubscribeBuilder) -> Result<u16> {
        self.require_connected()?;
        if builder.topics.is_empty() {
            return Err(Error::InvalidArgument("subscribe without topics".to_string()));
        }
        if let Some(t) = builder.topics.iter().find(|t| !topic::is_valid_filter(t.filter())) {
            return Err(Error::InvalidArgument(format!("invalid topic filter {:?}", t.filter())));
        }

        let packet_id = self.next_packet_id()?;
        let subscription_id = self.subscriptions.next_subscription_id();

        let properties = match self.options.protocol_version {
            ProtocolVersion::V5 => {
                let id = self
                    .server
                    .subscription_identifiers_available
                    .then_some(subscription_id);
                (id.is_some() || !builder.user_properties.is_empty()).then(|| SubscribeProperties {
                    id,
                    user_properties: builder.user_properties.clone(),
                })
            }
            ProtocolVersion::V4 => None,
        };

        let filters = builder.topics.iter().map(|t| t.filter.clone()).collect();
        let topics = builder
            .topics
            .into_iter()
            .map(|t| (t.filter.path, t.ack, t.on_message))
            .collect();
        self.subscriptions.add(subscription_id, packet_id, topics);

        self.send_packet(Packet::Subscribe(Subscribe {
            pkid: packet_id,
            filters,
            properties,
        }));
        Ok(packet_id)
    }

    /// Unsubscribe from one or more topic filters. Returns the packet id.
    pub fn begin_unsubscribe(&mut self, builder: UnsubscribeBuilder) -> Result<u16> {
        self.require_connected()?;
        if builder.topics.is_empty() {
            return Err(Error::InvalidArgument("unsubscribe without topics".to_string()));
        }

        let packet_id = self.next_packet_id()?;
        let properties = (self.options.protocol_version == ProtocolVersion::V5
            && !builder.user_properties.is_empty())
        .then(|| UnsubscribeProperties {
            user_properties: builder.user_properties.clone(),
        });
        let filters = builder.topics.iter().map(|(f, _)| f.clone()).collect();
        self.subscriptions.add_unsubscribe(packet_id, builder.topics);

        self.send_packet(Packet::Unsubscribe(Unsubscribe {
            pkid: packet_id,
            filters,
            properties,
        }));
        Ok(packet_id)
    }

    /// Register `topic` for automatic topic-alias use. The first publish
    /// carries the name and the alias, later ones only the alias.
    pub fn add_topic_alias(&mut self, topic: &str) -> Result<u16> {
        if self.options.protocol_version != ProtocolVersion::V5 {
            return Err(Error::UnsupportedVersion("topic aliases require MQTT 5.0".to_string()));
        }
        self.require_connected()?;
        self.session
            .topic_aliases()
            .add(topic, self.server.topic_alias_maximum)
    }

    /// Send an AUTH packet of an extended authentication exchange.
    pub fn begin_auth(&mut self, builder: AuthBuilder) -> Result<()> {
        if self.options.protocol_version != ProtocolVersion::V5 {
            return Err(Error::UnsupportedVersion("AUTH requires MQTT 5.0".to_string()));
        }
        if self.state < ClientState::TransportConnected || self.state > ClientState::Connected {
            return Err(Error::NotConnected(self.state));
        }
        self.send_packet(builder.build());
        Ok(())
    }

    fn require_connected(&self) -> Result<()> {
        if self.state != ClientState::Connected {
            return Err(Error::NotConnected(self.state));
        }
        Ok(())
    }

    // ---- Tick ----

    /// Process transport events, keep-alive and session saves.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// [`tick`](Self::tick) with an explicit clock.
    pub fn tick_at(&mut self, now: Instant) {
        self.now = now;
        self.begin_buffer();

        while let Some(event) = self.transport.poll_event() {
            match event {
                TransportEvent::StateChanged { state, reason } => {
                    self.on_transport_state(state, reason);
                }
                TransportEvent::Packet { packet, size } => {
                    if self.state < ClientState::TransportConnected || self.state >= ClientState::Disconnecting {
                        trace!("dropping {} in state {}", packet.name(), self.state);
                        continue;
                    }
                    self.handle_packet(packet, size);
                }
                TransportEvent::Error(e) => {
                    if e.mqtt_kind().is_some() {
                        self.mqtt_error(e);
                    } else {
                        self.fail(DisconnectReasonCode::UnspecifiedError, &e);
                    }
                }
            }
        }

        if self.cancel.is_cancelled()
            && matches!(
                self.state,
                ClientState::TransportConnecting | ClientState::TransportConnected
            )
        {
            info!("connect cancelled");
            if let Err(e) = self.session.queued().clear() {
                error!("failed to clear queued packets: {}", e);
            }
            self.outbound.clear();
            self.transport.begin_disconnect();
            self.set_disconnected(DisconnectReasonCode::MaximumConnectTime, "connect cancelled");
        }

        if self.state == ClientState::Connected {
            self.check_keep_alive(now);
        }

        if now.saturating_duration_since(self.last_save) >= self.options.flush_interval {
            self.last_save = now;
            if let Err(e) = self.session.save() {
                error!("failed to save session: {}", e);
            }
        }

        self.end_buffer();
    }

    fn check_keep_alive(&mut self, now: Instant) {
        if self.keep_alive == 0 {
            return;
        }

        if let Some(sent_at) = self.ping_sent_at {
            let timeout = Duration::from_secs(cmp::max(self.keep_alive / 2, 1) as u64);
            if now.saturating_duration_since(sent_at) >= timeout {
                warn!("no PINGRESP within {:?}", timeout);
                let err = Error::Io(io::Error::new(io::ErrorKind::TimedOut, "keep-alive timeout"));
                self.disconnect_with(DisconnectReasonCode::KeepAliveTimeout, &err);
            }
            return;
        }

        let interval = Duration::from_secs(self.keep_alive as u64);
        if now.saturating_duration_since(self.last_packet_sent_at) >= interval {
            trace!("sending PINGREQ");
            self.ping_sent_at = Some(now);
            self.send_packet(Packet::PingReq);
        }
    }

    fn on_transport_state(&mut self, state: TransportState, reason: Option<String>) {
        trace!("transport {:?} ({:?}) in state {}", state, reason, self.state);
        match state {
            TransportState::Connected => {
                if self.state == ClientState::TransportConnecting && !self.cancel.is_cancelled() {
                    self.send_connect();
                }
            }
            TransportState::Disconnected => {
                let connecting = matches!(
                    self.state,
                    ClientState::TransportConnecting | ClientState::TransportConnected
                );
                if connecting && self.cancel.is_cancelled() {
                    self.set_disconnected(DisconnectReasonCode::MaximumConnectTime, "connect cancelled");
                    return;
                }
                let (code, default_reason) = self.disconnect_reason.take().unwrap_or((
                    DisconnectReasonCode::NormalDisconnection,
                    "transport closed".to_string(),
                ));
                let reason = reason.unwrap_or(default_reason);
                self.set_disconnected(code, &reason);
            }
            TransportState::DisconnectedWithError => {
                let reason = reason.unwrap_or_else(|| "transport failed".to_string());
                self.fail(DisconnectReasonCode::UnspecifiedError, &Error::Io(io::Error::other(reason)));
            }
            TransportState::Initial | TransportState::Connecting | TransportState::Disconnecting => {}
        }
    }

    fn send_connect(&mut self) {
        if let Some(customize) = self.callbacks.customize_connect.as_mut() {
            let connect = &mut self.connect;
            let _ = guard("connect", || {
                customize(connect);
                Ok(())
            });
        }

        let client_id = self.session.client_id().unwrap_or_default().to_string();
        self.keep_alive = self.connect.keep_alive();
        let packet = self.connect.build(&client_id, self.options.protocol_version);
        self.set_state(ClientState::TransportConnected);
        self.send_packet(packet);
    }

    // ---- State and failure handling ----

    fn set_state(&mut self, state: ClientState) {
        if state <= self.state {
            trace!("ignoring transition {} -> {}", self.state, state);
            return;
        }
        let old = self.state;
        self.state = state;
        debug!("state {} -> {}", old, state);

        let result = match self.callbacks.on_state_changed.as_mut() {
            Some(cb) => guard("state changed", || cb(old, state)),
            None => Ok(()),
        };
        self.check_callback(result);
    }

    fn set_disconnected(&mut self, code: DisconnectReasonCode, reason: &str) {
        if self.state == ClientState::Disconnected {
            return;
        }
        info!("disconnected: {:?} {}", code, reason);
        self.set_state(ClientState::Disconnected);
        self.subscriptions.clear_pending();
        self.ping_sent_at = None;

        if let Some(cb) = self.callbacks.on_disconnect.as_mut() {
            let _ = guard("disconnect", || cb(code, reason));
        }
        if let Err(e) = self.session.save() {
            error!("failed to save session: {}", e);
        }
    }

    /// Report `err` and drop the connection without sending anything.
    fn fail(&mut self, code: DisconnectReasonCode, err: &Error) {
        if self.state == ClientState::Disconnected {
            return;
        }
        error!("connection failed: {}", err);
        if let Some(cb) = self.callbacks.on_error.as_mut() {
            let _ = guard("error", || cb(err));
        }
        self.outbound.clear();
        self.transport.begin_disconnect();
        self.set_disconnected(code, &err.to_string());
    }

    /// Send DISCONNECT with `code` when the protocol allows it, then fail.
    fn disconnect_with(&mut self, code: DisconnectReasonCode, err: &Error) {
        if self.state == ClientState::Disconnected {
            return;
        }
        let can_send = self.options.protocol_version == ProtocolVersion::V5
            && (ClientState::TransportConnected..=ClientState::Connected).contains(&self.state);
        if can_send {
            let properties = DisconnectProperties {
                session_expiry_interval: None,
                reason_string: Some(err.to_string()),
                user_properties: Vec::new(),
                server_reference: None,
            };
            self.send_packet(Packet::Disconnect(Disconnect {
                reason_code: code,
                properties: Some(properties),
            }));
        }
        self.flush_outbound();
        self.fail(code, err);
    }

    /// Tear the connection down for a protocol violation.
    fn mqtt_error(&mut self, err: Error) {
        let code = err
            .mqtt_kind()
            .map_or(DisconnectReasonCode::UnspecifiedError, MqttErrorKind::reason_code);
        self.disconnect_with(code, &err);
    }

    /// Route a callback result: protocol errors take the error path.
    fn check_callback(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.mqtt_error(e);
        }
    }

    // ---- Packet ids and quota ----

    /// Next packet id not used by any in-flight exchange.
    fn next_packet_id(&self) -> Result<u16> {
        for _ in 0..=u16::MAX {
            let id = self.packet_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id == 0 {
                continue;
            }
            let in_use = self.session.unacknowledged().is_packet_id_in_use(id)
                || self.session.released().contains(id)
                || self.session.queued().is_packet_id_in_use(id)
                || self.subscriptions.is_packet_id_pending(id);
            if !in_use {
                return Ok(id);
            }
        }
        Err(Error::InvalidState("no free packet identifier".to_string()))
    }

    #[cfg(test)]
    pub(crate) fn set_last_packet_id(&self, id: u16) {
        self.packet_id.store(id, Ordering::Relaxed);
    }

    /// Store and send a QoS 1/2 publish, taking one unit of quota.
    fn send_publish_packet(&mut self, packet_id: u16, publish: Publish) -> Result<()> {
        self.session.unacknowledged().add(packet_id, &publish)?;
        self.send_quota = self.send_quota.saturating_sub(1);
        trace!("sending packet {}, quota {}", packet_id, self.send_quota);
        self.send_packet(Packet::Publish(publish));
        Ok(())
    }

    /// Return one unit of quota and send queued publishes while it lasts.
    fn replenish_quota(&mut self) -> Result<()> {
        self.send_quota = cmp::min(self.send_quota_max, self.send_quota.saturating_add(1));

        while self.send_quota > 0 {
            let (packet_id, mut publish) = match self.session.queued().try_dequeue() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("skipping unreadable queued packet: {}", e);
                    continue;
                }
            };
            publish.pkid = packet_id;
            self.send_publish_packet(packet_id, publish)?;
        }
        Ok(())
    }

    // ---- Outbound buffering ----

    /// Start coalescing sends into one write. Calls nest.
    pub fn begin_buffer(&mut self) {
        self.buffer_depth += 1;
    }

    /// End a [`begin_buffer`](Self::begin_buffer) bracket, flushing when
    /// the outermost one closes.
    pub fn end_buffer(&mut self) {
        self.buffer_depth = self.buffer_depth.saturating_sub(1);
        if self.buffer_depth == 0 {
            self.flush_outbound();
        }
    }

    fn send_packet(&mut self, packet: Packet) {
        self.outbound.push(packet);
        if self.buffer_depth == 0 {
            self.flush_outbound();
        }
    }

    fn flush_outbound(&mut self) {
        if self.outbound.is_empty() {
            return;
        }
        let packets = std::mem::take(&mut self.outbound);
        if !(ClientState::TransportConnected..=ClientState::Connected).contains(&self.state) {
            debug!("dropping {} outbound packets in state {}", packets.len(), self.state);
            return;
        }

        let version = self.options.protocol_version;
        let limit = self.server.maximum_packet_size.map(|m| m as usize);
        let mut buf = BytesMut::new();
        for packet in &packets {
            let mut frame = BytesMut::new();
            if let Err(e) = protocol::encode(packet, version, &mut frame) {
                error!("failed to encode {}: {}", packet.name(), e);
                continue;
            }
            if let Some(limit) = limit {
                if frame.len() > limit {
                    warn!(
                        "skipping {} of {} bytes, server maximum is {}",
                        packet.name(),
                        frame.len(),
                        limit
                    );
                    continue;
                }
            }
            trace!("send {} ({} bytes)", packet.name(), frame.len());
            buf.extend_from_slice(&frame);
        }
        if buf.is_empty() {
            return;
        }

        self.last_packet_sent_at = self.now;
        if let Err(e) = self.transport.send(buf.freeze()) {
            self.fail(DisconnectReasonCode::UnspecifiedError, &e);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.session.save() {
            warn!("failed to save session on drop: {}", e);
        }
    }
}
