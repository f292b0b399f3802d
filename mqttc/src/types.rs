//! Common types for mqttc.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{
    ConnAckProperties, ConnectReturnCode, DisconnectReasonCode, PubRecReason, PublishProperties,
};

pub use rumqttc::v5::mqttbytes::QoS;

/// MQTT protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1
    V4,
    /// MQTT 5.0
    #[default]
    V5,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V4 => write!(f, "MQTT 3.1.1"),
            ProtocolVersion::V5 => write!(f, "MQTT 5.0"),
        }
    }
}

/// Connection state of a [`Client`](crate::Client).
///
/// States only move forward. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ClientState {
    #[default]
    Initial,
    TransportConnecting,
    TransportConnected,
    Connected,
    Disconnecting,
    Disconnected,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientState::Initial => "Initial",
            ClientState::TransportConnecting => "TransportConnecting",
            ClientState::TransportConnected => "TransportConnected",
            ClientState::Connected => "Connected",
            ClientState::Disconnecting => "Disconnecting",
            ClientState::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

/// An inbound PUBLISH as seen by the application.
#[derive(Debug, Clone, Default)]
pub struct ApplicationMessage {
    /// Topic name, with any server topic alias already resolved.
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Packet identifier, 0 for QoS 0.
    pub packet_id: u16,
    /// Subscription identifiers carried by the packet (MQTT 5.0).
    pub subscription_ids: Vec<usize>,
    pub properties: Option<PublishProperties>,
}

impl ApplicationMessage {
    /// Payload as UTF-8 text, if it is valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Server capabilities negotiated through CONNACK.
///
/// Absent properties take their MQTT 5.0 defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub receive_maximum: u16,
    pub maximum_qos: QoS,
    pub retain_available: bool,
    /// `None` means no limit.
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: u16,
    pub wildcard_subscription_available: bool,
    pub subscription_identifiers_available: bool,
    pub shared_subscription_available: bool,
    pub server_keep_alive: Option<u16>,
    pub assigned_client_identifier: Option<String>,
    pub session_expiry_interval: Option<u32>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            receive_maximum: u16::MAX,
            maximum_qos: QoS::ExactlyOnce,
            retain_available: true,
            maximum_packet_size: None,
            topic_alias_maximum: 0,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscription_available: true,
            server_keep_alive: None,
            assigned_client_identifier: None,
            session_expiry_interval: None,
            response_information: None,
            server_reference: None,
            reason_string: None,
        }
    }
}

impl ServerOptions {
    /// Apply CONNACK properties on top of the defaults.
    pub fn from_properties(properties: Option<&ConnAckProperties>) -> Self {
        let mut options = Self::default();
        let Some(p) = properties else {
            return options;
        };

        if let Some(v) = p.receive_max {
            options.receive_maximum = v;
        }
        if let Some(v) = p.max_qos {
            options.maximum_qos = qos_from_u8(v).unwrap_or(QoS::ExactlyOnce);
        }
        if let Some(v) = p.retain_available {
            options.retain_available = v != 0;
        }
        options.maximum_packet_size = p.max_packet_size;
        if let Some(v) = p.topic_alias_max {
            options.topic_alias_maximum = v;
        }
        if let Some(v) = p.wildcard_subscription_available {
            options.wildcard_subscription_available = v != 0;
        }
        if let Some(v) = p.subscription_identifiers_available {
            options.subscription_identifiers_available = v != 0;
        }
        if let Some(v) = p.shared_subscription_available {
            options.shared_subscription_available = v != 0;
        }
        options.server_keep_alive = p.server_keep_alive;
        options.assigned_client_identifier = p.assigned_client_identifier.clone();
        options.session_expiry_interval = p.session_expiry_interval;
        options.response_information = p.response_information.clone();
        options.server_reference = p.server_reference.clone();
        options.reason_string = p.reason_string.clone();
        options
    }
}

/// Map a numeric QoS.
pub fn qos_from_u8(value: u8) -> Option<QoS> {
    match value {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// True for PUBREC reason codes of 0x80 and above.
pub fn is_pubrec_error(reason: PubRecReason) -> bool {
    !matches!(
        reason,
        PubRecReason::Success | PubRecReason::NoMatchingSubscribers
    )
}

/// Carry a CONNACK failure code as a DISCONNECT reason code.
///
/// Codes without a DISCONNECT counterpart become `UnspecifiedError`.
pub fn connect_code_to_disconnect_reason(code: ConnectReturnCode) -> DisconnectReasonCode {
    use ConnectReturnCode as C;
    use DisconnectReasonCode as D;

    match code {
        C::Success => D::NormalDisconnection,
        C::MalformedPacket => D::MalformedPacket,
        C::ProtocolError => D::ProtocolError,
        C::ImplementationSpecificError => D::ImplementationSpecificError,
        C::NotAuthorized => D::NotAuthorized,
        C::ServerBusy => D::ServerBusy,
        C::TopicNameInvalid => D::TopicNameInvalid,
        C::PacketTooLarge => D::PacketTooLarge,
        C::QuotaExceeded => D::QuotaExceeded,
        C::PayloadFormatInvalid => D::PayloadFormatInvalid,
        C::RetainNotSupported => D::RetainNotSupported,
        C::QoSNotSupported => D::QoSNotSupported,
        C::UseAnotherServer => D::UseAnotherServer,
        C::ServerMoved => D::ServerMoved,
        C::ConnectionRateExceeded => D::ConnectionRateExceeded,
        _ => D::UnspecifiedError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        assert!(ClientState::Initial < ClientState::TransportConnecting);
        assert!(ClientState::TransportConnected < ClientState::Connected);
        assert!(ClientState::Disconnecting < ClientState::Disconnected);
    }

    #[test]
    fn test_server_options_defaults() {
        let options = ServerOptions::from_properties(None);
        assert_eq!(options.receive_maximum, 65535);
        assert_eq!(options.maximum_qos, QoS::ExactlyOnce);
        assert!(options.retain_available);
        assert_eq!(options.maximum_packet_size, None);
        assert_eq!(options.topic_alias_maximum, 0);
    }

    #[test]
    fn test_pubrec_error_class() {
        assert!(!is_pubrec_error(PubRecReason::Success));
        assert!(!is_pubrec_error(PubRecReason::NoMatchingSubscribers));
        assert!(is_pubrec_error(PubRecReason::QuotaExceeded));
        assert!(is_pubrec_error(PubRecReason::NotAuthorized));
    }

    #[test]
    fn test_connect_code_mapping() {
        assert_eq!(
            connect_code_to_disconnect_reason(ConnectReturnCode::NotAuthorized),
            DisconnectReasonCode::NotAuthorized
        );
        assert_eq!(
            connect_code_to_disconnect_reason(ConnectReturnCode::BadUserNamePassword),
            DisconnectReasonCode::UnspecifiedError
        );
    }
}
