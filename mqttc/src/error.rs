//! Error types for mqttc.

use std::io;

use rumqttc::v5::mqttbytes::v5::DisconnectReasonCode;

use crate::types::ClientState;

/// Result type alias for mqttc.
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol violations that end the connection with a DISCONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttErrorKind {
    /// Wire data violates the packet structure.
    MalformedPacket,
    /// A rule of the protocol state machine was broken.
    ProtocolError,
    /// The negotiated maximum packet size was exceeded.
    PacketTooLarge,
    /// The peer has more QoS 2 publishes in flight than we allowed.
    ReceiveMaximumExceeded,
}

impl MqttErrorKind {
    /// DISCONNECT reason code sent to the broker for this violation.
    pub fn reason_code(self) -> DisconnectReasonCode {
        match self {
            MqttErrorKind::MalformedPacket => DisconnectReasonCode::MalformedPacket,
            MqttErrorKind::ProtocolError => DisconnectReasonCode::ProtocolError,
            MqttErrorKind::PacketTooLarge => DisconnectReasonCode::PacketTooLarge,
            MqttErrorKind::ReceiveMaximumExceeded => DisconnectReasonCode::ReceiveMaximumExceeded,
        }
    }
}

impl std::fmt::Display for MqttErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MqttErrorKind::MalformedPacket => write!(f, "malformed packet"),
            MqttErrorKind::ProtocolError => write!(f, "protocol error"),
            MqttErrorKind::PacketTooLarge => write!(f, "packet too large"),
            MqttErrorKind::ReceiveMaximumExceeded => write!(f, "receive maximum exceeded"),
        }
    }
}

/// Error type for mqttc operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("mqttc: io error: {0}")]
    Io(#[from] io::Error),

    /// Packet encoding or decoding failed.
    #[error("mqttc: codec error: {0}")]
    Codec(String),

    /// Session index could not be read or written.
    #[error("mqttc: session index: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol violation.
    #[error("mqttc: {kind}: {reason}")]
    Mqtt { kind: MqttErrorKind, reason: String },

    /// Operation requires a connected client.
    #[error("mqttc: not connected (state {0:?})")]
    NotConnected(ClientState),

    /// Operation is not valid in the current state.
    #[error("mqttc: invalid state: {0}")]
    InvalidState(String),

    /// Invalid argument.
    #[error("mqttc: invalid argument: {0}")]
    InvalidArgument(String),

    /// Feature requires a different protocol version.
    #[error("mqttc: unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Record store content is inconsistent.
    #[error("mqttc: store corrupted: {0}")]
    StoreCorrupted(String),

    /// No free topic alias remains.
    #[error("mqttc: topic alias maximum {0} reached")]
    TopicAliasExhausted(u16),

    /// Broker refused the connection.
    #[error("mqttc: connection refused: {0}")]
    ConnectionRefused(String),

    /// Application callback failed.
    #[error("mqttc: callback failed: {0}")]
    Callback(String),
}

impl Error {
    /// Build a protocol violation error.
    pub fn mqtt(kind: MqttErrorKind, reason: impl Into<String>) -> Self {
        Error::Mqtt {
            kind,
            reason: reason.into(),
        }
    }

    /// Protocol violation kind, if this is one.
    pub fn mqtt_kind(&self) -> Option<MqttErrorKind> {
        match self {
            Error::Mqtt { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<rumqttc::mqttbytes::Error> for Error {
    fn from(e: rumqttc::mqttbytes::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<rumqttc::v5::mqttbytes::Error> for Error {
    fn from(e: rumqttc::v5::mqttbytes::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_reason_codes() {
        assert_eq!(MqttErrorKind::MalformedPacket.reason_code() as u8, 0x81);
        assert_eq!(MqttErrorKind::ProtocolError.reason_code() as u8, 0x82);
        assert_eq!(MqttErrorKind::PacketTooLarge.reason_code() as u8, 0x95);
        assert_eq!(MqttErrorKind::ReceiveMaximumExceeded.reason_code() as u8, 0x93);
    }

    #[test]
    fn test_mqtt_error_display() {
        let err = Error::mqtt(MqttErrorKind::ProtocolError, "duplicate property");
        assert_eq!(err.to_string(), "mqttc: protocol error: duplicate property");
        assert_eq!(err.mqtt_kind(), Some(MqttErrorKind::ProtocolError));
        assert_eq!(Error::InvalidArgument("x".into()).mqtt_kind(), None);
    }
}
