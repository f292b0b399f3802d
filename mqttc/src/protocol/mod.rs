//! MQTT packet model and codec.
//!
//! Packets are modelled with the MQTT 5.0 structures from rumqttc for both
//! protocol versions. MQTT 3.1.1 traffic is converted at the wire boundary,
//! dropping properties and mapping reason codes. AUTH and the two-byte
//! DISCONNECT are framed here since rumqttc does not decode them.

pub mod auth;
pub mod codec;

use bytes::{Bytes, BytesMut};
use rumqttc::mqttbytes::v4;

pub use auth::{AuthPacket, AuthProperties, AuthReasonCode};
pub use rumqttc::v5::mqttbytes::v5::{
    ConnAck, ConnAckProperties, Connect, ConnectProperties, ConnectReturnCode, Disconnect,
    DisconnectProperties, DisconnectReasonCode, Filter, LastWill, LastWillProperties, Login,
    PubAck, PubAckReason, PubComp, PubCompReason, PubRec, PubRecReason, PubRel, PubRelReason,
    Publish, PublishProperties, RetainForwardRule, SubAck, Subscribe, SubscribeProperties,
    SubscribeReasonCode, UnsubAck, UnsubAckReason, Unsubscribe, UnsubscribeProperties,
};

use crate::error::{Error, MqttErrorKind, Result};
use crate::types::{ProtocolVersion, QoS};
use codec::read_frame_header;

use rumqttc::v5::mqttbytes::v5 as wire5;

const AUTH: u8 = 15;
const DISCONNECT: u8 = 14;

/// An MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect, Option<LastWill>, Option<Login>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    Auth(AuthPacket),
}

impl Packet {
    /// Packet type name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(..) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect(_) => "DISCONNECT",
            Packet::Auth(_) => "AUTH",
        }
    }
}

/// Append the wire form of `packet` to `out`; returns the bytes written.
pub fn encode(packet: &Packet, version: ProtocolVersion, out: &mut BytesMut) -> Result<usize> {
    match version {
        ProtocolVersion::V5 => {
            if let Packet::Auth(auth) = packet {
                return auth.write(out);
            }
            Ok(to_v5(packet.clone())?.write(out, None)?)
        }
        ProtocolVersion::V4 => {
            let packet = to_v4(packet.clone())?;
            Ok(packet.write(out, usize::MAX)?)
        }
    }
}

/// Encoded size of `packet`.
pub fn encoded_len(packet: &Packet, version: ProtocolVersion) -> Result<usize> {
    match (version, packet) {
        (ProtocolVersion::V5, Packet::Auth(auth)) => Ok(auth.size()),
        (ProtocolVersion::V5, _) => Ok(to_v5(packet.clone())?.size()),
        (ProtocolVersion::V4, _) => Ok(to_v4(packet.clone())?.size()),
    }
}

/// Take one complete packet off the front of `buf`.
///
/// Returns `Ok(None)` while the frame is incomplete; otherwise the packet
/// and its size on the wire.
pub fn decode(buf: &mut BytesMut, version: ProtocolVersion) -> Result<Option<(Packet, usize)>> {
    let Some(header) = read_frame_header(buf)? else {
        return Ok(None);
    };
    let frame_len = header.frame_len();
    if buf.len() < frame_len {
        return Ok(None);
    }
    let mut frame = buf.split_to(frame_len);

    let packet = match (version, header.packet_type()) {
        (ProtocolVersion::V5, AUTH) => Packet::Auth(AuthPacket::read(header, frame.freeze())?),
        (ProtocolVersion::V4, AUTH) => {
            return Err(malformed("AUTH is not an MQTT 3.1.1 packet"));
        }
        (ProtocolVersion::V5, DISCONNECT) if header.remaining_len == 0 => {
            if header.flags() != 0 {
                return Err(malformed("disconnect flags must be zero"));
            }
            Packet::Disconnect(Disconnect::new(DisconnectReasonCode::NormalDisconnection))
        }
        (ProtocolVersion::V5, _) => {
            let packet = wire5::Packet::read(&mut frame, None).map_err(|e| malformed(e.to_string()))?;
            from_v5(packet)?
        }
        (ProtocolVersion::V4, _) => {
            let packet = v4::Packet::read(&mut frame, frame_len).map_err(|e| malformed(e.to_string()))?;
            from_v4(packet)?
        }
    };

    Ok(Some((packet, frame_len)))
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::mqtt(MqttErrorKind::MalformedPacket, reason)
}

fn to_v5(packet: Packet) -> Result<wire5::Packet> {
    Ok(match packet {
        Packet::Connect(c, will, login) => wire5::Packet::Connect(c, will, login),
        Packet::ConnAck(p) => wire5::Packet::ConnAck(p),
        Packet::Publish(p) => wire5::Packet::Publish(p),
        Packet::PubAck(p) => wire5::Packet::PubAck(p),
        Packet::PubRec(p) => wire5::Packet::PubRec(p),
        Packet::PubRel(p) => wire5::Packet::PubRel(p),
        Packet::PubComp(p) => wire5::Packet::PubComp(p),
        Packet::Subscribe(p) => wire5::Packet::Subscribe(p),
        Packet::SubAck(p) => wire5::Packet::SubAck(p),
        Packet::Unsubscribe(p) => wire5::Packet::Unsubscribe(p),
        Packet::UnsubAck(p) => wire5::Packet::UnsubAck(p),
        Packet::PingReq => wire5::Packet::PingReq(wire5::PingReq),
        Packet::PingResp => wire5::Packet::PingResp(wire5::PingResp),
        Packet::Disconnect(p) => wire5::Packet::Disconnect(p),
        Packet::Auth(_) => return Err(Error::Codec("AUTH is framed by AuthPacket".to_string())),
    })
}

fn from_v5(packet: wire5::Packet) -> Result<Packet> {
    Ok(match packet {
        wire5::Packet::Connect(c, will, login) => Packet::Connect(c, will, login),
        wire5::Packet::ConnAck(p) => Packet::ConnAck(p),
        wire5::Packet::Publish(p) => Packet::Publish(p),
        wire5::Packet::PubAck(p) => Packet::PubAck(p),
        wire5::Packet::PubRec(p) => Packet::PubRec(p),
        wire5::Packet::PubRel(p) => Packet::PubRel(p),
        wire5::Packet::PubComp(p) => Packet::PubComp(p),
        wire5::Packet::Subscribe(p) => Packet::Subscribe(p),
        wire5::Packet::SubAck(p) => Packet::SubAck(p),
        wire5::Packet::Unsubscribe(p) => Packet::Unsubscribe(p),
        wire5::Packet::UnsubAck(p) => Packet::UnsubAck(p),
        wire5::Packet::PingReq(_) => Packet::PingReq,
        wire5::Packet::PingResp(_) => Packet::PingResp,
        wire5::Packet::Disconnect(p) => Packet::Disconnect(p),
        wire5::Packet::Auth(_) => return Err(malformed("unexpected AUTH frame")),
    })
}

fn to_v4(packet: Packet) -> Result<v4::Packet> {
    Ok(match packet {
        Packet::Connect(c, will, login) => v4::Packet::Connect(v4::Connect {
            protocol: rumqttc::mqttbytes::Protocol::V4,
            keep_alive: c.keep_alive,
            client_id: c.client_id,
            clean_session: c.clean_start,
            last_will: will
                .map(|w| -> Result<v4::LastWill> {
                    Ok(v4::LastWill {
                        topic: topic_string(w.topic)?,
                        message: w.message,
                        qos: qos_to_v4(w.qos),
                        retain: w.retain,
                    })
                })
                .transpose()?,
            login: login.map(|l| v4::Login {
                username: l.username,
                password: l.password,
            }),
        }),
        Packet::ConnAck(p) => v4::Packet::ConnAck(v4::ConnAck {
            session_present: p.session_present,
            code: connect_code_to_v4(p.code),
        }),
        Packet::Publish(p) => v4::Packet::Publish(v4::Publish {
            dup: p.dup,
            qos: qos_to_v4(p.qos),
            retain: p.retain,
            topic: topic_string(p.topic)?,
            pkid: p.pkid,
            payload: p.payload,
        }),
        Packet::PubAck(p) => v4::Packet::PubAck(v4::PubAck::new(p.pkid)),
        Packet::PubRec(p) => v4::Packet::PubRec(v4::PubRec::new(p.pkid)),
        Packet::PubRel(p) => v4::Packet::PubRel(v4::PubRel::new(p.pkid)),
        Packet::PubComp(p) => v4::Packet::PubComp(v4::PubComp::new(p.pkid)),
        Packet::Subscribe(p) => v4::Packet::Subscribe(v4::Subscribe {
            pkid: p.pkid,
            filters: p
                .filters
                .into_iter()
                .map(|f| v4::SubscribeFilter::new(f.path, qos_to_v4(f.qos)))
                .collect(),
        }),
        Packet::SubAck(p) => v4::Packet::SubAck(v4::SubAck {
            pkid: p.pkid,
            return_codes: p
                .return_codes
                .into_iter()
                .map(|code| match code {
                    SubscribeReasonCode::Success(qos) => {
                        v4::SubscribeReasonCode::Success(qos_to_v4(qos))
                    }
                    _ => v4::SubscribeReasonCode::Failure,
                })
                .collect(),
        }),
        Packet::Unsubscribe(p) => v4::Packet::Unsubscribe(v4::Unsubscribe {
            pkid: p.pkid,
            topics: p.filters,
        }),
        Packet::UnsubAck(p) => v4::Packet::UnsubAck(v4::UnsubAck::new(p.pkid)),
        Packet::PingReq => v4::Packet::PingReq,
        Packet::PingResp => v4::Packet::PingResp,
        Packet::Disconnect(_) => v4::Packet::Disconnect,
        Packet::Auth(_) => {
            return Err(Error::UnsupportedVersion(
                "AUTH requires MQTT 5.0".to_string(),
            ));
        }
    })
}

fn from_v4(packet: v4::Packet) -> Result<Packet> {
    Ok(match packet {
        v4::Packet::Connect(c) => {
            let will = c.last_will.map(|w| LastWill {
                topic: Bytes::from(w.topic),
                message: w.message,
                qos: qos_from_v4(w.qos),
                retain: w.retain,
                properties: None,
            });
            let login = c.login.map(|l| Login {
                username: l.username,
                password: l.password,
            });
            let connect = Connect {
                keep_alive: c.keep_alive,
                client_id: c.client_id,
                clean_start: c.clean_session,
                properties: None,
            };
            Packet::Connect(connect, will, login)
        }
        v4::Packet::ConnAck(p) => Packet::ConnAck(ConnAck {
            session_present: p.session_present,
            code: connect_code_from_v4(p.code),
            properties: None,
        }),
        v4::Packet::Publish(p) => Packet::Publish(Publish {
            dup: p.dup,
            qos: qos_from_v4(p.qos),
            retain: p.retain,
            topic: Bytes::from(p.topic),
            pkid: p.pkid,
            payload: p.payload,
            properties: None,
        }),
        v4::Packet::PubAck(p) => Packet::PubAck(PubAck::new(p.pkid, None)),
        v4::Packet::PubRec(p) => Packet::PubRec(PubRec::new(p.pkid, None)),
        v4::Packet::PubRel(p) => Packet::PubRel(PubRel::new(p.pkid, None)),
        v4::Packet::PubComp(p) => Packet::PubComp(PubComp::new(p.pkid, None)),
        v4::Packet::Subscribe(p) => Packet::Subscribe(Subscribe {
            pkid: p.pkid,
            filters: p
                .filters
                .into_iter()
                .map(|f| Filter::new(f.path, qos_from_v4(f.qos)))
                .collect(),
            properties: None,
        }),
        v4::Packet::SubAck(p) => Packet::SubAck(SubAck {
            pkid: p.pkid,
            return_codes: p
                .return_codes
                .into_iter()
                .map(|code| match code {
                    v4::SubscribeReasonCode::Success(qos) => {
                        SubscribeReasonCode::Success(qos_from_v4(qos))
                    }
                    v4::SubscribeReasonCode::Failure => SubscribeReasonCode::Failure,
                })
                .collect(),
            properties: None,
        }),
        v4::Packet::Unsubscribe(p) => Packet::Unsubscribe(Unsubscribe {
            pkid: p.pkid,
            filters: p.topics,
            properties: None,
        }),
        v4::Packet::UnsubAck(p) => Packet::UnsubAck(UnsubAck {
            pkid: p.pkid,
            // MQTT 3.1.1 acknowledges every filter without a reason code.
            reasons: Vec::new(),
            properties: None,
        }),
        v4::Packet::PingReq => Packet::PingReq,
        v4::Packet::PingResp => Packet::PingResp,
        v4::Packet::Disconnect => {
            Packet::Disconnect(Disconnect::new(DisconnectReasonCode::NormalDisconnection))
        }
    })
}

fn topic_string(topic: Bytes) -> Result<String> {
    String::from_utf8(topic.to_vec()).map_err(|_| malformed("topic is not utf-8"))
}

pub(crate) fn qos_to_v4(qos: QoS) -> rumqttc::mqttbytes::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::mqttbytes::QoS::ExactlyOnce,
    }
}

pub(crate) fn qos_from_v4(qos: rumqttc::mqttbytes::QoS) -> QoS {
    match qos {
        rumqttc::mqttbytes::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::mqttbytes::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::mqttbytes::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn connect_code_from_v4(code: v4::ConnectReturnCode) -> ConnectReturnCode {
    match code {
        v4::ConnectReturnCode::Success => ConnectReturnCode::Success,
        v4::ConnectReturnCode::RefusedProtocolVersion => ConnectReturnCode::RefusedProtocolVersion,
        v4::ConnectReturnCode::BadClientId => ConnectReturnCode::BadClientId,
        v4::ConnectReturnCode::ServiceUnavailable => ConnectReturnCode::ServiceUnavailable,
        v4::ConnectReturnCode::BadUserNamePassword => ConnectReturnCode::BadUserNamePassword,
        v4::ConnectReturnCode::NotAuthorized => ConnectReturnCode::NotAuthorized,
    }
}

fn connect_code_to_v4(code: ConnectReturnCode) -> v4::ConnectReturnCode {
    match code {
        ConnectReturnCode::Success => v4::ConnectReturnCode::Success,
        ConnectReturnCode::RefusedProtocolVersion | ConnectReturnCode::UnsupportedProtocolVersion => {
            v4::ConnectReturnCode::RefusedProtocolVersion
        }
        ConnectReturnCode::BadClientId | ConnectReturnCode::ClientIdentifierNotValid => {
            v4::ConnectReturnCode::BadClientId
        }
        ConnectReturnCode::BadUserNamePassword => v4::ConnectReturnCode::BadUserNamePassword,
        ConnectReturnCode::NotAuthorized => v4::ConnectReturnCode::NotAuthorized,
        _ => v4::ConnectReturnCode::ServiceUnavailable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(packet: &Packet, version: ProtocolVersion) -> BytesMut {
        let mut buf = BytesMut::new();
        let written = encode(packet, version, &mut buf).unwrap();
        assert_eq!(written, buf.len());
        assert_eq!(encoded_len(packet, version).unwrap(), written);
        buf
    }

    fn publish(topic: &str, qos: QoS, pkid: u16) -> Publish {
        let mut p = Publish::new(topic, qos, "payload", None);
        p.pkid = pkid;
        p
    }

    #[test]
    fn test_decode_incomplete() {
        let mut buf = wire(&Packet::Publish(publish("a/b", QoS::AtLeastOnce, 7)), ProtocolVersion::V5);
        let full = buf.clone();
        buf.truncate(full.len() - 1);
        assert!(decode(&mut buf, ProtocolVersion::V5).unwrap().is_none());
        assert_eq!(buf.len(), full.len() - 1);
    }

    #[test]
    fn test_decode_two_frames() {
        let mut buf = wire(&Packet::PingResp, ProtocolVersion::V5);
        buf.extend_from_slice(&wire(&Packet::PubAck(PubAck::new(3, None)), ProtocolVersion::V5));

        let (first, size) = decode(&mut buf, ProtocolVersion::V5).unwrap().unwrap();
        assert_eq!(first, Packet::PingResp);
        assert_eq!(size, 2);
        let (second, _) = decode(&mut buf, ProtocolVersion::V5).unwrap().unwrap();
        assert!(matches!(second, Packet::PubAck(ack) if ack.pkid == 3));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_short_disconnect() {
        let mut buf = BytesMut::from(&[0xE0u8, 0x00][..]);
        let (packet, size) = decode(&mut buf, ProtocolVersion::V5).unwrap().unwrap();
        assert_eq!(size, 2);
        assert!(matches!(
            packet,
            Packet::Disconnect(d) if d.reason_code == DisconnectReasonCode::NormalDisconnection
        ));

        let mut buf = BytesMut::from(&[0xE0u8, 0x00][..]);
        let (packet, _) = decode(&mut buf, ProtocolVersion::V4).unwrap().unwrap();
        assert!(matches!(packet, Packet::Disconnect(_)));
    }

    #[test]
    fn test_v4_publish_drops_properties() {
        let mut p = publish("t", QoS::ExactlyOnce, 9);
        p.properties = Some(PublishProperties {
            topic_alias: Some(1),
            ..Default::default()
        });
        let mut buf = wire(&Packet::Publish(p), ProtocolVersion::V4);
        let (packet, _) = decode(&mut buf, ProtocolVersion::V4).unwrap().unwrap();
        let Packet::Publish(decoded) = packet else {
            panic!("expected publish");
        };
        assert_eq!(decoded.topic, Bytes::from_static(b"t"));
        assert_eq!(decoded.qos, QoS::ExactlyOnce);
        assert_eq!(decoded.pkid, 9);
        assert_eq!(decoded.properties, None);
    }

    #[test]
    fn test_v4_connack_code() {
        let mut buf = BytesMut::from(&[0x20u8, 0x02, 0x01, 0x05][..]);
        let (packet, _) = decode(&mut buf, ProtocolVersion::V4).unwrap().unwrap();
        let Packet::ConnAck(ack) = packet else {
            panic!("expected connack");
        };
        assert!(ack.session_present);
        assert_eq!(ack.code, ConnectReturnCode::NotAuthorized);
    }

    #[test]
    fn test_auth_requires_v5() {
        let mut buf = BytesMut::new();
        let err = encode(&Packet::Auth(AuthPacket::default()), ProtocolVersion::V4, &mut buf).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(_)));

        let mut buf = BytesMut::from(&[0xF0u8, 0x00][..]);
        assert!(decode(&mut buf, ProtocolVersion::V4).is_err());
        let mut buf = BytesMut::from(&[0xF0u8, 0x00][..]);
        assert!(matches!(
            decode(&mut buf, ProtocolVersion::V5).unwrap(),
            Some((Packet::Auth(_), 2))
        ));
    }

    #[test]
    fn test_malformed_frame() {
        // PUBACK claiming one byte of body.
        let mut buf = BytesMut::from(&[0x40u8, 0x01, 0x00][..]);
        let err = decode(&mut buf, ProtocolVersion::V5).unwrap_err();
        assert_eq!(err.mqtt_kind(), Some(MqttErrorKind::MalformedPacket));
    }
}
