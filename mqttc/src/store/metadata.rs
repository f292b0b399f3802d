//! Record metadata and its on-disk encoding.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use crate::error::{Error, Result};

/// Status and modifier bits of a record.
///
/// `NONE` is the status bit every live record carries. `USER_ADDED` and
/// `LOCKED` are modifiers that can be set and cleared independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetadataFlags(u8);

impl MetadataFlags {
    pub const NONE: MetadataFlags = MetadataFlags(0x01);
    pub const USER_ADDED: MetadataFlags = MetadataFlags(0x02);
    pub const LOCKED: MetadataFlags = MetadataFlags(0x04);

    /// Build flags from raw bits.
    pub const fn from_bits(bits: u8) -> Self {
        MetadataFlags(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `flag` is set.
    pub const fn contains(self, flag: MetadataFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    /// Iterate over the individual bits that are set.
    pub fn iter(self) -> impl Iterator<Item = MetadataFlags> {
        (0..8)
            .map(|i| 1u8 << i)
            .filter(move |mask| self.0 & mask != 0)
            .map(MetadataFlags)
    }
}

impl Default for MetadataFlags {
    fn default() -> Self {
        MetadataFlags::NONE
    }
}

impl BitOr for MetadataFlags {
    type Output = MetadataFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        MetadataFlags(self.0 | rhs.0)
    }
}

impl BitAnd for MetadataFlags {
    type Output = MetadataFlags;

    fn bitand(self, rhs: Self) -> Self::Output {
        MetadataFlags(self.0 & rhs.0)
    }
}

impl Not for MetadataFlags {
    type Output = MetadataFlags;

    fn not(self) -> Self::Output {
        MetadataFlags(!self.0)
    }
}

impl fmt::Display for MetadataFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(MetadataFlags::NONE) {
            names.push("None");
        }
        if self.contains(MetadataFlags::USER_ADDED) {
            names.push("UserAdded");
        }
        if self.contains(MetadataFlags::LOCKED) {
            names.push("Locked");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// Per-store extra fields persisted after the common metadata fields.
pub trait MetadataExtra: Clone + Default + Send + Sync + 'static {
    /// Append the encoded extra fields.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decode the extra fields from the front of `buf`, advancing it.
    fn decode(buf: &mut &[u8]) -> Result<Self>;
}

impl MetadataExtra for () {
    fn encode(&self, _out: &mut Vec<u8>) {}

    fn decode(_buf: &mut &[u8]) -> Result<Self> {
        Ok(())
    }
}

/// Describes one logical record of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata<E> {
    /// Stable slot id, equal to the position in the metadata list.
    pub index: usize,
    /// Payload offset, or -1 once deleted.
    pub file_position: i32,
    /// Payload length, or -1 once deleted.
    pub length: i32,
    pub flags: MetadataFlags,
    pub extra: E,
}

impl<E: MetadataExtra> Metadata<E> {
    pub fn new(index: usize, file_position: i32, length: i32, flags: MetadataFlags, extra: E) -> Self {
        Self {
            index,
            file_position,
            length,
            flags,
            extra,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.file_position == -1 && self.length == -1
    }

    pub fn mark_for_delete(&mut self) {
        self.file_position = -1;
        self.length = -1;
    }

    pub fn is_user_added(&self) -> bool {
        self.flags.contains(MetadataFlags::USER_ADDED)
    }

    pub fn set_user_added(&mut self, on: bool) {
        self.set_flag(MetadataFlags::USER_ADDED, on);
    }

    pub fn is_locked(&self) -> bool {
        self.flags.contains(MetadataFlags::LOCKED)
    }

    pub fn set_locked(&mut self, on: bool) {
        self.set_flag(MetadataFlags::LOCKED, on);
    }

    /// Set or clear a modifier bit. The `NONE` status bit is never cleared.
    pub fn set_flag(&mut self, flag: MetadataFlags, on: bool) {
        if on {
            self.flags = self.flags | flag;
        } else {
            self.flags = (self.flags & !flag) | MetadataFlags::NONE;
        }
    }

    /// Encode as varint position, varint length, flag byte, then the extras.
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_varint(out, self.file_position as u32);
        write_varint(out, self.length as u32);
        out.push(self.flags.bits());
        self.extra.encode(out);
    }

    /// Decode one entry; `index` is its position in the metadata file.
    pub fn decode(index: usize, buf: &mut &[u8]) -> Result<Self> {
        let file_position = read_varint(buf)? as i32;
        let length = read_varint(buf)? as i32;
        let (&flags, rest) = buf
            .split_first()
            .ok_or_else(|| Error::StoreCorrupted("metadata truncated before flags".to_string()))?;
        *buf = rest;
        let extra = E::decode(buf)?;
        Ok(Self {
            index,
            file_position,
            length,
            flags: MetadataFlags::from_bits(flags),
            extra,
        })
    }
}

impl<E> fmt::Display for Metadata<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Metadata idx: {}, pos: {}, len: {}, flags: {}, deleted: {}]",
            self.index,
            self.file_position,
            self.length,
            self.flags,
            self.file_position == -1 && self.length == -1
        )
    }
}

/// Write a variable byte integer (7 bits per byte, high bit = continuation).
pub fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read a variable byte integer of at most five bytes, advancing `buf`.
pub fn read_varint(buf: &mut &[u8]) -> Result<u32> {
    let mut value = 0u64;
    let mut shift = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            *buf = &buf[i + 1..];
            return u32::try_from(value)
                .map_err(|_| Error::StoreCorrupted(format!("varint overflow: {}", value)));
        }
        shift += 7;
        if shift >= 35 {
            return Err(Error::StoreCorrupted("malformed variable byte integer".to_string()));
        }
    }

    Err(Error::StoreCorrupted("truncated variable byte integer".to_string()))
}

/// Read a big-endian u16 from the front of `buf`.
pub fn read_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.len() < 2 {
        return Err(Error::StoreCorrupted("truncated u16".to_string()));
    }
    let value = u16::from_be_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(value)
}

/// Read a big-endian u32 from the front of `buf`.
pub fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.len() < 4 {
        return Err(Error::StoreCorrupted("truncated u32".to_string()));
    }
    let value = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(value)
}
