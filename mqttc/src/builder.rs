//! Request builders.
//!
//! Every request the client sends starts as a builder. Builders are plain
//! values; nothing is sent until they are handed to the matching
//! `Client::begin_*` method.

use std::sync::Arc;

use bytes::Bytes;

use crate::client::callbacks::{
    MessageCallback, SubscribeAckCallback, UnsubscribeAckCallback,
};
use crate::error::Result;
use crate::protocol::{
    AuthPacket, AuthProperties, AuthReasonCode, Connect, ConnectProperties, Disconnect,
    DisconnectProperties, DisconnectReasonCode, Filter, LastWill, LastWillProperties, Login,
    Packet, PublishProperties, RetainForwardRule, SubscribeReasonCode, UnsubAckReason,
};
use crate::session::Session;
use crate::types::{ApplicationMessage, ProtocolVersion, QoS};

/// Default keep-alive in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 60;

/// Receive maximum assumed when CONNECT does not set one.
pub const DEFAULT_RECEIVE_MAXIMUM: u16 = u16::MAX;

/// Last will message carried by CONNECT.
#[derive(Debug, Clone, Default)]
pub struct LastWillBuilder {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    delay_interval: Option<u32>,
    payload_format_indicator: Option<u8>,
    message_expiry_interval: Option<u32>,
    content_type: Option<String>,
    response_topic: Option<String>,
    correlation_data: Option<Bytes>,
    user_properties: Vec<(String, String)>,
}

impl LastWillBuilder {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Seconds the server waits before publishing the will.
    pub fn with_delay_interval(mut self, seconds: u32) -> Self {
        self.delay_interval = Some(seconds);
        self
    }

    /// Mark the payload as UTF-8 text.
    pub fn with_utf8_payload(mut self) -> Self {
        self.payload_format_indicator = Some(1);
        self
    }

    pub fn with_message_expiry_interval(mut self, seconds: u32) -> Self {
        self.message_expiry_interval = Some(seconds);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_response_topic(mut self, topic: impl Into<String>) -> Self {
        self.response_topic = Some(topic.into());
        self
    }

    pub fn with_correlation_data(mut self, data: impl Into<Bytes>) -> Self {
        self.correlation_data = Some(data.into());
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    fn build(&self, version: ProtocolVersion) -> LastWill {
        let has_properties = self.delay_interval.is_some()
            || self.payload_format_indicator.is_some()
            || self.message_expiry_interval.is_some()
            || self.content_type.is_some()
            || self.response_topic.is_some()
            || self.correlation_data.is_some()
            || !self.user_properties.is_empty();
        let properties = (version == ProtocolVersion::V5 && has_properties).then(|| {
            LastWillProperties {
                delay_interval: self.delay_interval,
                payload_format_indicator: self.payload_format_indicator,
                message_expiry_interval: self.message_expiry_interval,
                content_type: self.content_type.clone(),
                response_topic: self.response_topic.clone(),
                correlation_data: self.correlation_data.clone(),
                user_properties: self.user_properties.clone(),
            }
        });

        LastWill {
            topic: Bytes::copy_from_slice(self.topic.as_bytes()),
            message: self.payload.clone(),
            qos: self.qos,
            retain: self.retain,
            properties,
        }
    }
}

/// Parameters of the CONNECT packet and of session selection.
#[derive(Debug, Clone)]
pub struct ConnectBuilder {
    clean_start: bool,
    keep_alive: u16,
    client_id: Option<String>,
    session: Option<Arc<Session>>,
    null_session: bool,
    user_name: Option<String>,
    password: Option<String>,
    session_expiry_interval: Option<u32>,
    receive_maximum: Option<u16>,
    maximum_packet_size: Option<u32>,
    topic_alias_maximum: Option<u16>,
    request_response_information: Option<bool>,
    request_problem_information: Option<bool>,
    user_properties: Vec<(String, String)>,
    authentication_method: Option<String>,
    authentication_data: Option<Bytes>,
    last_will: Option<LastWillBuilder>,
}

impl Default for ConnectBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectBuilder {
    pub fn new() -> Self {
        Self {
            clean_start: false,
            keep_alive: DEFAULT_KEEP_ALIVE,
            client_id: None,
            session: None,
            null_session: false,
            user_name: None,
            password: None,
            session_expiry_interval: None,
            receive_maximum: None,
            maximum_packet_size: None,
            topic_alias_maximum: None,
            request_response_information: None,
            request_problem_information: None,
            user_properties: Vec::new(),
            authentication_method: None,
            authentication_data: None,
            last_will: None,
        }
    }

    /// Ask the server to discard any previous session.
    pub fn with_clean_start(mut self, clean: bool) -> Self {
        self.clean_start = clean;
        self
    }

    /// Keep-alive in seconds; 0 turns pings off.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Use the stored session of `client_id`, creating it if needed.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Connect with an empty client id and an in-memory session, letting
    /// the server assign the id.
    pub fn with_null_session(mut self) -> Self {
        self.null_session = true;
        self
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_session_expiry_interval(mut self, seconds: u32) -> Self {
        self.session_expiry_interval = Some(seconds);
        self
    }

    /// Largest number of QoS 2 publishes the server may have in flight
    /// towards us.
    pub fn with_receive_maximum(mut self, maximum: u16) -> Self {
        self.receive_maximum = Some(maximum);
        self
    }

    pub fn with_maximum_packet_size(mut self, size: u32) -> Self {
        self.maximum_packet_size = Some(size);
        self
    }

    /// Largest topic alias the server may use towards us.
    pub fn with_topic_alias_maximum(mut self, maximum: u16) -> Self {
        self.topic_alias_maximum = Some(maximum);
        self
    }

    pub fn with_request_response_information(mut self, request: bool) -> Self {
        self.request_response_information = Some(request);
        self
    }

    pub fn with_request_problem_information(mut self, request: bool) -> Self {
        self.request_problem_information = Some(request);
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    /// Start extended authentication with `method`.
    pub fn with_extended_authentication(mut self, method: impl Into<String>, data: Option<Bytes>) -> Self {
        self.authentication_method = Some(method.into());
        self.authentication_data = data;
        self
    }

    pub fn with_last_will(mut self, will: LastWillBuilder) -> Self {
        self.last_will = Some(will);
        self
    }

    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub(crate) fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub(crate) fn wants_null_session(&self) -> bool {
        self.null_session
    }

    pub fn receive_maximum(&self) -> u16 {
        self.receive_maximum.unwrap_or(DEFAULT_RECEIVE_MAXIMUM)
    }

    pub fn maximum_packet_size(&self) -> Option<u32> {
        self.maximum_packet_size
    }

    pub fn topic_alias_maximum(&self) -> u16 {
        self.topic_alias_maximum.unwrap_or(0)
    }

    /// CONNECT for `client_id`.
    pub(crate) fn build(&self, client_id: &str, version: ProtocolVersion) -> Packet {
        let properties = (version == ProtocolVersion::V5).then(|| {
            let mut properties = ConnectProperties::new();
            properties.session_expiry_interval = self.session_expiry_interval;
            properties.receive_maximum = self.receive_maximum;
            properties.max_packet_size = self.maximum_packet_size;
            properties.topic_alias_max = self.topic_alias_maximum;
            properties.request_response_info = self.request_response_information.map(u8::from);
            properties.request_problem_info = self.request_problem_information.map(u8::from);
            properties.user_properties = self.user_properties.clone();
            properties.authentication_method = self.authentication_method.clone();
            properties.authentication_data = self.authentication_data.clone();
            properties
        });

        let connect = Connect {
            keep_alive: self.keep_alive,
            client_id: client_id.to_string(),
            clean_start: self.clean_start,
            properties,
        };
        let will = self.last_will.as_ref().map(|w| w.build(version));
        let login = self.user_name.as_ref().map(|user| {
            Login::new(user.clone(), self.password.clone().unwrap_or_default())
        });
        Packet::Connect(connect, will, login)
    }
}

/// An outbound application message.
#[derive(Debug, Clone, Default)]
pub struct PublishBuilder {
    pub(crate) topic: String,
    pub(crate) payload: Bytes,
    pub(crate) qos: QoS,
    pub(crate) retain: bool,
    pub(crate) topic_alias: Option<u16>,
    payload_format_indicator: Option<u8>,
    message_expiry_interval: Option<u32>,
    response_topic: Option<String>,
    correlation_data: Option<Bytes>,
    user_properties: Vec<(String, String)>,
    content_type: Option<String>,
}

impl PublishBuilder {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Mark the payload as UTF-8 text.
    pub fn with_utf8_payload(mut self) -> Self {
        self.payload_format_indicator = Some(1);
        self
    }

    pub fn with_message_expiry_interval(mut self, seconds: u32) -> Self {
        self.message_expiry_interval = Some(seconds);
        self
    }

    /// Map `alias` to this topic for the rest of the connection.
    pub fn with_topic_alias(mut self, alias: u16) -> Self {
        self.topic_alias = Some(alias);
        self
    }

    pub fn with_response_topic(mut self, topic: impl Into<String>) -> Self {
        self.response_topic = Some(topic.into());
        self
    }

    pub fn with_correlation_data(mut self, data: impl Into<Bytes>) -> Self {
        self.correlation_data = Some(data.into());
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Properties without the topic alias, or `None` if there are none.
    pub(crate) fn properties(&self) -> Option<PublishProperties> {
        let properties = PublishProperties {
            payload_format_indicator: self.payload_format_indicator,
            message_expiry_interval: self.message_expiry_interval,
            topic_alias: None,
            response_topic: self.response_topic.clone(),
            correlation_data: self.correlation_data.clone(),
            user_properties: self.user_properties.clone(),
            subscription_identifiers: Vec::new(),
            content_type: self.content_type.clone(),
        };
        (properties != PublishProperties::default()).then_some(properties)
    }
}

/// One topic filter of a SUBSCRIBE request.
pub struct SubscribeTopic {
    pub(crate) filter: Filter,
    pub(crate) ack: Option<SubscribeAckCallback>,
    pub(crate) on_message: Option<MessageCallback>,
}

impl SubscribeTopic {
    /// Subscribe to `filter` with maximum QoS 0.
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: Filter::new(filter, QoS::AtMostOnce),
            ack: None,
            on_message: None,
        }
    }

    pub fn with_maximum_qos(mut self, qos: QoS) -> Self {
        self.filter.qos = qos;
        self
    }

    /// Do not receive our own publishes on this filter.
    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.filter.nolocal = no_local;
        self
    }

    pub fn with_retain_as_published(mut self, retain_as_published: bool) -> Self {
        self.filter.preserve_retain = retain_as_published;
        self
    }

    pub fn with_retain_handling(mut self, rule: RetainForwardRule) -> Self {
        self.filter.retain_forward_rule = rule;
        self
    }

    /// Called with this filter's SUBACK reason code.
    pub fn with_ack_callback<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str, SubscribeReasonCode) -> Result<()> + Send + 'static,
    {
        self.ack = Some(Box::new(f));
        self
    }

    /// Called for every message routed to this filter.
    pub fn with_message_callback<F>(mut self, f: F) -> Self
    where
        F: FnMut(&ApplicationMessage) -> Result<()> + Send + 'static,
    {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn filter(&self) -> &str {
        &self.filter.path
    }
}

impl std::fmt::Debug for SubscribeTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeTopic")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// A SUBSCRIBE request for one or more topic filters.
#[derive(Debug, Default)]
pub struct SubscribeBuilder {
    pub(crate) topics: Vec<SubscribeTopic>,
    pub(crate) user_properties: Vec<(String, String)>,
}

impl SubscribeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(mut self, topic: SubscribeTopic) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }
}

impl From<SubscribeTopic> for SubscribeBuilder {
    fn from(topic: SubscribeTopic) -> Self {
        Self::new().with_topic(topic)
    }
}

/// An UNSUBSCRIBE request.
#[derive(Default)]
pub struct UnsubscribeBuilder {
    pub(crate) topics: Vec<(String, Option<UnsubscribeAckCallback>)>,
    pub(crate) user_properties: Vec<(String, String)>,
}

impl UnsubscribeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(mut self, filter: impl Into<String>) -> Self {
        self.topics.push((filter.into(), None));
        self
    }

    /// Unsubscribe from `filter`, reporting its UNSUBACK reason code.
    pub fn with_topic_ack<F>(mut self, filter: impl Into<String>, f: F) -> Self
    where
        F: FnMut(&str, UnsubAckReason) -> Result<()> + Send + 'static,
    {
        self.topics.push((filter.into(), Some(Box::new(f))));
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }
}

impl std::fmt::Debug for UnsubscribeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let filters: Vec<&str> = self.topics.iter().map(|(t, _)| t.as_str()).collect();
        f.debug_struct("UnsubscribeBuilder")
            .field("filters", &filters)
            .finish_non_exhaustive()
    }
}

/// A graceful DISCONNECT.
#[derive(Debug, Clone)]
pub struct DisconnectBuilder {
    pub(crate) reason_code: DisconnectReasonCode,
    session_expiry_interval: Option<u32>,
    reason_string: Option<String>,
    user_properties: Vec<(String, String)>,
}

impl Default for DisconnectBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DisconnectBuilder {
    pub fn new() -> Self {
        Self {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            session_expiry_interval: None,
            reason_string: None,
            user_properties: Vec::new(),
        }
    }

    pub fn with_reason_code(mut self, code: DisconnectReasonCode) -> Self {
        self.reason_code = code;
        self
    }

    pub fn with_session_expiry_interval(mut self, seconds: u32) -> Self {
        self.session_expiry_interval = Some(seconds);
        self
    }

    pub fn with_reason_string(mut self, reason: impl Into<String>) -> Self {
        self.reason_string = Some(reason.into());
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    pub(crate) fn build(&self) -> Packet {
        let has_properties = self.session_expiry_interval.is_some()
            || self.reason_string.is_some()
            || !self.user_properties.is_empty();
        let properties = has_properties.then(|| DisconnectProperties {
            session_expiry_interval: self.session_expiry_interval,
            reason_string: self.reason_string.clone(),
            user_properties: self.user_properties.clone(),
            server_reference: None,
        });
        Packet::Disconnect(Disconnect {
            reason_code: self.reason_code,
            properties,
        })
    }

    pub(crate) fn reason_string(&self) -> Option<&str> {
        self.reason_string.as_deref()
    }
}

/// An AUTH packet of an extended authentication exchange.
#[derive(Debug, Clone, Default)]
pub struct AuthBuilder {
    reason_code: AuthReasonCode,
    properties: AuthProperties,
}

impl AuthBuilder {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            reason_code: AuthReasonCode::ContinueAuthentication,
            properties: AuthProperties {
                method: Some(method.into()),
                ..Default::default()
            },
        }
    }

    pub fn with_reason_code(mut self, code: AuthReasonCode) -> Self {
        self.reason_code = code;
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.properties.data = Some(data.into());
        self
    }

    pub fn with_reason_string(mut self, reason: impl Into<String>) -> Self {
        self.properties.reason_string = Some(reason.into());
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.user_properties.push((key.into(), value.into()));
        self
    }

    pub(crate) fn build(&self) -> Packet {
        Packet::Auth(AuthPacket {
            reason_code: self.reason_code,
            properties: self.properties.clone(),
        })
    }
}
