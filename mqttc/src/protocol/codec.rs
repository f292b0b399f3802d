//! MQTT encoding primitives.
//!
//! Framing and the few field types needed by the packets that are
//! encoded by hand.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, MqttErrorKind, Result};

/// Fixed header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// First byte: packet type in the high nibble, flags in the low nibble.
    pub byte1: u8,
    /// Length of the fixed header (1 + remaining length bytes).
    pub header_len: usize,
    pub remaining_len: usize,
}

impl FrameHeader {
    pub fn packet_type(&self) -> u8 {
        self.byte1 >> 4
    }

    pub fn flags(&self) -> u8 {
        self.byte1 & 0x0F
    }

    /// Total frame length.
    pub fn frame_len(&self) -> usize {
        self.header_len + self.remaining_len
    }
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::mqtt(MqttErrorKind::MalformedPacket, reason)
}

/// Read a variable byte integer.
///
/// Returns `Ok(None)` while more bytes are needed.
pub fn read_variable_int(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut multiplier = 1u32;
    let mut value = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(malformed("variable byte integer longer than 4 bytes"));
        }
        value += (byte & 0x7F) as u32 * multiplier;

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(malformed("variable byte integer longer than 4 bytes"));
    }
    Ok(None)
}

/// Write a variable byte integer; returns the number of bytes written.
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize> {
    if value > 268_435_455 {
        return Err(Error::Codec(format!("variable byte integer {} out of range", value)));
    }

    let mut written = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);
        written += 1;

        if value == 0 {
            break;
        }
    }

    Ok(written)
}

/// Number of bytes needed for a variable byte integer.
pub const fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Parse the fixed header at the front of `buf`.
///
/// Returns `Ok(None)` while the header itself is incomplete.
pub fn read_frame_header(buf: &[u8]) -> Result<Option<FrameHeader>> {
    let Some(&byte1) = buf.first() else {
        return Ok(None);
    };
    let Some((remaining_len, var_len)) = read_variable_int(&buf[1..])? else {
        return Ok(None);
    };

    Ok(Some(FrameHeader {
        byte1,
        header_len: 1 + var_len,
        remaining_len: remaining_len as usize,
    }))
}

pub fn read_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(malformed("truncated byte"));
    }
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(malformed("truncated two byte integer"));
    }
    Ok(buf.get_u16())
}

/// Read binary data (2-byte length prefix + data).
pub fn read_binary(buf: &mut Bytes) -> Result<Bytes> {
    let len = read_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(malformed("truncated binary data"));
    }
    Ok(buf.split_to(len))
}

/// Read a UTF-8 string (2-byte length prefix + data).
pub fn read_string(buf: &mut Bytes) -> Result<String> {
    let bytes = read_binary(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| malformed("string is not utf-8"))
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| Error::Codec(format!("field of {} bytes exceeds 65535", data.len())))?;
    buf.put_u16(len);
    buf.extend_from_slice(data);
    Ok(())
}

/// Write a UTF-8 string (2-byte length prefix + data).
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    write_binary(buf, s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_int() {
        for value in [0u32, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, 268_435_455] {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            assert_eq!(written, variable_int_len(value));
            assert_eq!(read_variable_int(&buf).unwrap(), Some((value, written)));
        }
        assert!(write_variable_int(&mut BytesMut::new(), 268_435_456).is_err());
    }

    #[test]
    fn test_variable_int_incomplete_and_malformed() {
        assert_eq!(read_variable_int(&[0x80, 0x80]).unwrap(), None);
        assert!(read_variable_int(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
    }

    #[test]
    fn test_frame_header() {
        let header = read_frame_header(&[0x30, 0xC1, 0x02]).unwrap().unwrap();
        assert_eq!(header.packet_type(), 3);
        assert_eq!(header.header_len, 3);
        assert_eq!(header.remaining_len, 321);
        assert_eq!(header.frame_len(), 324);

        assert_eq!(read_frame_header(&[0x30]).unwrap(), None);
        assert_eq!(read_frame_header(&[]).unwrap(), None);
    }

    #[test]
    fn test_string_fields() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "auth").unwrap();
        write_binary(&mut buf, &[1, 2, 3]).unwrap();

        let mut bytes = buf.freeze();
        assert_eq!(read_string(&mut bytes).unwrap(), "auth");
        assert_eq!(read_binary(&mut bytes).unwrap(), Bytes::from_static(&[1, 2, 3]));
        assert!(read_u8(&mut bytes).is_err());
    }
}
