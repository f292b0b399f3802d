//! MQTT 5.0 AUTH packet.

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{
    FrameHeader, read_binary, read_string, read_u8, read_variable_int, variable_int_len,
    write_binary, write_string, write_variable_int,
};
use crate::error::{Error, MqttErrorKind, Result};

const AUTHENTICATION_METHOD: u8 = 0x15;
const AUTHENTICATION_DATA: u8 = 0x16;
const REASON_STRING: u8 = 0x1F;
const USER_PROPERTY: u8 = 0x26;

/// AUTH reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AuthReasonCode {
    #[default]
    Success = 0x00,
    ContinueAuthentication = 0x18,
    ReAuthenticate = 0x19,
}

impl TryFrom<u8> for AuthReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(AuthReasonCode::Success),
            0x18 => Ok(AuthReasonCode::ContinueAuthentication),
            0x19 => Ok(AuthReasonCode::ReAuthenticate),
            v => Err(Error::mqtt(
                MqttErrorKind::MalformedPacket,
                format!("invalid auth reason code 0x{:02X}", v),
            )),
        }
    }
}

/// Properties of an AUTH packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthProperties {
    pub method: Option<String>,
    pub data: Option<Bytes>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl AuthProperties {
    fn is_empty(&self) -> bool {
        self.method.is_none()
            && self.data.is_none()
            && self.reason_string.is_none()
            && self.user_properties.is_empty()
    }

    fn len(&self) -> usize {
        let mut len = 0;
        if let Some(method) = &self.method {
            len += 1 + 2 + method.len();
        }
        if let Some(data) = &self.data {
            len += 1 + 2 + data.len();
        }
        if let Some(reason) = &self.reason_string {
            len += 1 + 2 + reason.len();
        }
        for (key, value) in &self.user_properties {
            len += 1 + 2 + key.len() + 2 + value.len();
        }
        len
    }
}

/// Extended authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthPacket {
    pub reason_code: AuthReasonCode,
    pub properties: AuthProperties,
}

impl AuthPacket {
    fn remaining_len(&self) -> usize {
        if self.reason_code == AuthReasonCode::Success && self.properties.is_empty() {
            return 0;
        }
        let props = self.properties.len();
        1 + variable_int_len(props as u32) + props
    }

    /// Encoded size including the fixed header.
    pub fn size(&self) -> usize {
        let len = self.remaining_len();
        1 + variable_int_len(len as u32) + len
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let len = self.remaining_len();
        buf.put_u8(0xF0);
        let count = write_variable_int(buf, len as u32)?;
        if len == 0 {
            return Ok(1 + count);
        }

        buf.put_u8(self.reason_code as u8);
        let p = &self.properties;
        write_variable_int(buf, p.len() as u32)?;
        if let Some(method) = &p.method {
            buf.put_u8(AUTHENTICATION_METHOD);
            write_string(buf, method)?;
        }
        if let Some(data) = &p.data {
            buf.put_u8(AUTHENTICATION_DATA);
            write_binary(buf, data)?;
        }
        if let Some(reason) = &p.reason_string {
            buf.put_u8(REASON_STRING);
            write_string(buf, reason)?;
        }
        for (key, value) in &p.user_properties {
            buf.put_u8(USER_PROPERTY);
            write_string(buf, key)?;
            write_string(buf, value)?;
        }
        Ok(1 + count + len)
    }

    /// Decode from a complete frame.
    pub fn read(header: FrameHeader, mut frame: Bytes) -> Result<Self> {
        if header.flags() != 0 {
            return Err(Error::mqtt(MqttErrorKind::MalformedPacket, "auth flags must be zero"));
        }
        let _ = frame.split_to(header.header_len);
        if header.remaining_len == 0 {
            return Ok(Self::default());
        }

        let reason_code = AuthReasonCode::try_from(read_u8(&mut frame)?)?;
        if header.remaining_len == 1 {
            return Ok(Self {
                reason_code,
                properties: AuthProperties::default(),
            });
        }

        let Some((props_len, used)) = read_variable_int(&frame)? else {
            return Err(Error::mqtt(MqttErrorKind::MalformedPacket, "truncated property length"));
        };
        let _ = frame.split_to(used);
        if frame.len() < props_len as usize {
            return Err(Error::mqtt(MqttErrorKind::MalformedPacket, "truncated properties"));
        }
        let mut props = frame.split_to(props_len as usize);

        let mut properties = AuthProperties::default();
        while !props.is_empty() {
            let id = read_u8(&mut props)?;
            match id {
                AUTHENTICATION_METHOD => {
                    let value = read_string(&mut props)?;
                    set_once(&mut properties.method, value, "authentication method")?;
                }
                AUTHENTICATION_DATA => {
                    let value = read_binary(&mut props)?;
                    set_once(&mut properties.data, value, "authentication data")?;
                }
                REASON_STRING => {
                    let value = read_string(&mut props)?;
                    set_once(&mut properties.reason_string, value, "reason string")?;
                }
                USER_PROPERTY => {
                    let key = read_string(&mut props)?;
                    let value = read_string(&mut props)?;
                    properties.user_properties.push((key, value));
                }
                other => {
                    return Err(Error::mqtt(
                        MqttErrorKind::MalformedPacket,
                        format!("property 0x{:02X} not allowed in auth", other),
                    ));
                }
            }
        }

        Ok(Self {
            reason_code,
            properties,
        })
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, name: &str) -> Result<()> {
    if slot.is_some() {
        return Err(Error::mqtt(
            MqttErrorKind::ProtocolError,
            format!("{} appears twice", name),
        ));
    }
    *slot = Some(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::read_frame_header;

    fn decode(bytes: &[u8]) -> Result<AuthPacket> {
        let header = read_frame_header(bytes)?.unwrap();
        AuthPacket::read(header, Bytes::copy_from_slice(bytes))
    }

    #[test]
    fn test_empty_success() {
        let packet = AuthPacket::default();
        let mut buf = BytesMut::new();
        assert_eq!(packet.write(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..], &[0xF0, 0x00]);
        assert_eq!(decode(&buf).unwrap(), packet);
    }

    #[test]
    fn test_continue_with_properties() {
        let packet = AuthPacket {
            reason_code: AuthReasonCode::ContinueAuthentication,
            properties: AuthProperties {
                method: Some("SCRAM-SHA-1".into()),
                data: Some(Bytes::from_static(b"client-first")),
                reason_string: None,
                user_properties: vec![("k".into(), "v".into())],
            },
        };
        let mut buf = BytesMut::new();
        let written = packet.write(&mut buf).unwrap();
        assert_eq!(written, buf.len());
        assert_eq!(written, packet.size());
        assert_eq!(decode(&buf).unwrap(), packet);
    }

    #[test]
    fn test_duplicate_method_is_protocol_error() {
        // reason 0x18, properties: method "a" twice
        let bytes = [0xF0, 0x0A, 0x18, 0x08, 0x15, 0x00, 0x01, b'a', 0x15, 0x00, 0x01, b'a'];
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.mqtt_kind(), Some(MqttErrorKind::ProtocolError));
    }

    #[test]
    fn test_invalid_reason_code() {
        let err = decode(&[0xF0, 0x01, 0x42]).unwrap_err();
        assert_eq!(err.mqtt_kind(), Some(MqttErrorKind::MalformedPacket));
    }
}
