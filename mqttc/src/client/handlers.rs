//! Inbound packet handling.

use std::cmp;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use super::Client;
use super::callbacks::guard;
use crate::error::{Error, MqttErrorKind, Result};
use crate::protocol::{
    AuthPacket, ConnAck, ConnectReturnCode, Disconnect, Packet, PubAck, PubComp, PubCompReason,
    PubRec, PubRel, PubRelReason, Publish, SubAck, UnsubAck,
};
use crate::types::{
    ApplicationMessage, ClientState, QoS, ServerOptions, connect_code_to_disconnect_reason,
    is_pubrec_error,
};

fn protocol_error(reason: impl Into<String>) -> Error {
    Error::mqtt(MqttErrorKind::ProtocolError, reason)
}

impl Client {
    pub(super) fn handle_packet(&mut self, packet: Packet, size: usize) {
        if let Some(maximum) = self.connect.maximum_packet_size() {
            if size > maximum as usize {
                self.mqtt_error(Error::mqtt(
                    MqttErrorKind::PacketTooLarge,
                    format!("{} of {} bytes exceeds {}", packet.name(), size, maximum),
                ));
                return;
            }
        }
        trace!("received {} ({} bytes)", packet.name(), size);

        let before_connack = self.state == ClientState::TransportConnected;
        let result = match packet {
            Packet::ConnAck(ack) => self.handle_connack(ack),
            Packet::Auth(auth) => self.handle_auth(auth),
            Packet::Disconnect(disconnect) => self.handle_disconnect(disconnect),
            packet if before_connack => Err(protocol_error(format!("{} before CONNACK", packet.name()))),
            Packet::Publish(publish) => self.handle_publish(publish),
            Packet::PubAck(ack) => self.handle_puback(ack),
            Packet::PubRec(rec) => self.handle_pubrec(rec),
            Packet::PubRel(rel) => self.handle_pubrel(rel),
            Packet::PubComp(comp) => self.handle_pubcomp(comp),
            Packet::SubAck(ack) => self.handle_suback(ack),
            Packet::UnsubAck(ack) => self.handle_unsuback(ack),
            Packet::PingResp => {
                self.ping_sent_at = None;
                Ok(())
            }
            packet @ (Packet::Connect(..)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq) => Err(protocol_error(format!("unexpected {} from server", packet.name()))),
        };

        if let Err(e) = result {
            if e.mqtt_kind().is_some() {
                self.mqtt_error(e);
            } else {
                error!("failed to handle packet: {}", e);
                if let Some(cb) = self.callbacks.on_error.as_mut() {
                    let _ = guard("error", || cb(&e));
                }
            }
        }
    }

    fn handle_connack(&mut self, ack: ConnAck) -> Result<()> {
        if self.state != ClientState::TransportConnected {
            return Err(protocol_error(format!("CONNACK in state {}", self.state)));
        }

        if ack.code != ConnectReturnCode::Success {
            let code = connect_code_to_disconnect_reason(ack.code);
            let reason = ack
                .properties
                .as_ref()
                .and_then(|p| p.reason_string.clone())
                .unwrap_or_else(|| format!("{:?}", ack.code));
            if let Some(cb) = self.callbacks.on_connack.as_mut() {
                let _ = guard("connack", || cb(&ack));
            }
            self.fail(code, &Error::ConnectionRefused(reason));
            return Ok(());
        }

        self.server = ServerOptions::from_properties(ack.properties.as_ref());
        self.send_quota_max = cmp::max(self.server.receive_maximum.saturating_sub(1), 1);
        self.send_quota = self.send_quota_max;

        if let Some(assigned) = self.server.assigned_client_identifier.clone() {
            if self.session.client_id() != Some(assigned.as_str()) {
                info!("server assigned client id {}", assigned);
                self.session = self.options.sessions.get(&self.options.host, Some(&assigned))?;
            }
        }

        self.session.queued().clear()?;
        if ack.session_present {
            self.message_delivery_retry()?;
        } else {
            debug!("no session on server, resetting local QoS state");
            self.session.unacknowledged().clear()?;
            self.session.received().clear()?;
            self.session.released().clear()?;
        }
        self.session.topic_aliases().clear()?;
        self.server_topic_aliases.clear();

        self.keep_alive = self.server.server_keep_alive.unwrap_or(self.connect.keep_alive());
        self.ping_sent_at = None;
        self.set_state(ClientState::Connected);
        info!(
            "connected, session present {}, quota {}, keep-alive {}s",
            ack.session_present, self.send_quota, self.keep_alive
        );

        let result = match self.callbacks.on_connected.as_mut() {
            Some(cb) => guard("connected", || cb()),
            None => Ok(()),
        };
        self.check_callback(result);
        let result = match self.callbacks.on_connack.as_mut() {
            Some(cb) => guard("connack", || cb(&ack)),
            None => Ok(()),
        };
        self.check_callback(result);
        Ok(())
    }

    /// Resend unacknowledged publishes with DUP set, oldest id first, and
    /// every outstanding PUBREL.
    fn message_delivery_retry(&mut self) -> Result<()> {
        let mut after = 0;
        while self.send_quota > 0 {
            let Some((packet_id, mut publish)) = self.session.unacknowledged().get_next(after)? else {
                break;
            };
            after = packet_id;
            publish.dup = true;

            // Aliases do not survive the connection; resend the full name.
            let alias = publish.properties.as_mut().and_then(|p| p.topic_alias.take());
            if let Some(alias) = alias {
                if publish.topic.is_empty() {
                    match self.session.topic_aliases().find_by_alias(alias)? {
                        Some(topic) => publish.topic = Bytes::from(topic),
                        None => {
                            error!("packet {} uses unknown topic alias {}, not resending", packet_id, alias);
                            continue;
                        }
                    }
                }
                // The alias store is cleared below; later replays need the full name.
                self.session.unacknowledged().replace(packet_id, &publish)?;
            }

            debug!("resending packet {}", packet_id);
            self.send_quota -= 1;
            self.send_packet(Packet::Publish(publish));
        }

        for packet_id in self.session.released().values() {
            debug!("resending PUBREL {}", packet_id);
            self.send_packet(Packet::PubRel(PubRel::new(packet_id, None)));
        }
        Ok(())
    }

    fn handle_publish(&mut self, publish: Publish) -> Result<()> {
        let mut topic = String::from_utf8(publish.topic.to_vec())
            .map_err(|_| Error::mqtt(MqttErrorKind::MalformedPacket, "topic is not UTF-8"))?;

        let alias = publish.properties.as_ref().and_then(|p| p.topic_alias);
        if let Some(alias) = alias {
            let maximum = self.connect.topic_alias_maximum();
            if alias == 0 || alias > maximum {
                return Err(protocol_error(format!("topic alias {} outside 1..={}", alias, maximum)));
            }
            if topic.is_empty() {
                topic = self
                    .server_topic_aliases
                    .get(&alias)
                    .cloned()
                    .ok_or_else(|| protocol_error(format!("unknown topic alias {}", alias)))?;
            } else {
                self.server_topic_aliases.insert(alias, topic.clone());
            }
        } else if topic.is_empty() {
            return Err(protocol_error("empty topic without alias"));
        }

        let message = ApplicationMessage {
            topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.pkid,
            subscription_ids: publish
                .properties
                .as_ref()
                .map(|p| p.subscription_identifiers.clone())
                .unwrap_or_default(),
            properties: publish.properties,
        };

        match message.qos {
            QoS::AtMostOnce => self.deliver(&message),
            QoS::AtLeastOnce => {
                self.deliver(&message)?;
                self.send_packet(Packet::PubAck(PubAck::new(message.packet_id, None)));
                Ok(())
            }
            QoS::ExactlyOnce => {
                let received = self.session.received();
                if received.contains(message.packet_id) {
                    debug!("duplicate QoS 2 publish {}, not delivering", message.packet_id);
                } else {
                    // A rejected id is not recorded, so a redelivery is not taken for a duplicate.
                    let maximum = self.connect.receive_maximum() as usize;
                    if received.count() >= maximum {
                        return Err(Error::mqtt(
                            MqttErrorKind::ReceiveMaximumExceeded,
                            format!("{} QoS 2 publishes in flight, maximum {}", received.count() + 1, maximum),
                        ));
                    }
                    received.add(message.packet_id)?;
                    self.deliver(&message)?;
                }
                self.send_packet(Packet::PubRec(PubRec::new(message.packet_id, None)));
                Ok(())
            }
        }
    }

    /// Per-topic callbacks first, then the client-wide one.
    fn deliver(&mut self, message: &ApplicationMessage) -> Result<()> {
        let routed = self.subscriptions.route(message)?;
        trace!("{} routed to {} subscription callbacks", message.topic, routed);
        if let Some(cb) = self.callbacks.on_message.as_mut() {
            guard("message", || cb(message))?;
        }
        Ok(())
    }

    fn handle_puback(&mut self, ack: PubAck) -> Result<()> {
        if !self.session.unacknowledged().try_remove_by_packet_id(ack.pkid)? {
            warn!("PUBACK for unknown packet {}", ack.pkid);
        }
        self.replenish_quota()
    }

    fn handle_pubrec(&mut self, rec: PubRec) -> Result<()> {
        let found = self.session.unacknowledged().try_remove_by_packet_id(rec.pkid)?;
        if is_pubrec_error(rec.reason) {
            warn!("PUBREC {} rejected: {:?}", rec.pkid, rec.reason);
            return self.replenish_quota();
        }

        let released = self.session.released();
        let reason = if found || released.contains(rec.pkid) {
            released.add(rec.pkid)?;
            PubRelReason::Success
        } else {
            warn!("PUBREC for unknown packet {}", rec.pkid);
            PubRelReason::PacketIdentifierNotFound
        };
        let mut rel = PubRel::new(rec.pkid, None);
        rel.reason = reason;
        self.send_packet(Packet::PubRel(rel));
        Ok(())
    }

    fn handle_pubrel(&mut self, rel: PubRel) -> Result<()> {
        let mut comp = PubComp::new(rel.pkid, None);
        if !self.session.received().remove(rel.pkid)? {
            warn!("PUBREL for unknown packet {}", rel.pkid);
            comp.reason = PubCompReason::PacketIdentifierNotFound;
        }
        self.send_packet(Packet::PubComp(comp));
        Ok(())
    }

    fn handle_pubcomp(&mut self, comp: PubComp) -> Result<()> {
        if !self.session.released().remove(comp.pkid)? {
            warn!("PUBCOMP for unknown packet {}", comp.pkid);
        }
        self.replenish_quota()
    }

    fn handle_suback(&mut self, ack: SubAck) -> Result<()> {
        self.subscriptions.acknowledge_subscribe(ack.pkid, &ack.return_codes)
    }

    fn handle_unsuback(&mut self, ack: UnsubAck) -> Result<()> {
        self.subscriptions.acknowledge_unsubscribe(ack.pkid, &ack.reasons)
    }

    fn handle_disconnect(&mut self, disconnect: Disconnect) -> Result<()> {
        let reason = disconnect
            .properties
            .and_then(|p| p.reason_string)
            .unwrap_or_else(|| format!("server disconnected: {:?}", disconnect.reason_code));
        info!("server sent DISCONNECT {:?}: {}", disconnect.reason_code, reason);

        self.session.queued().clear()?;
        self.transport.begin_disconnect();
        self.set_disconnected(disconnect.reason_code, &reason);
        Ok(())
    }

    fn handle_auth(&mut self, auth: AuthPacket) -> Result<()> {
        trace!("AUTH {:?}", auth.reason_code);
        if let Some(cb) = self.callbacks.on_auth.as_mut() {
            guard("auth", || cb(&auth))?;
        }
        Ok(())
    }
}
