//! MQTT Packet Codec
//!
//! Framing for the v3.1.1 wire format:
//! `[type << 4 | flags][remaining length, 1-4 bytes][payload]`.
//!
//! A [`Packet`] is the raw frame. It carries a cursor into its payload that
//! the field readers advance, so no field can be read past the remaining
//! length. Typed packet bodies live in [`crate::protocol`].

mod decode;


pub use decode::{read_packet, Decoder, ReadError};

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::{DecodeError, EncodeError, PacketType};

/// Maximum remaining length (268,435,455 bytes = ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Maximum number of bytes in a remaining length encoding
pub const MAX_REMAINING_LENGTH_BYTES: usize = 4;

/// Read a Variable Byte Integer from buffer
/// Returns (value, bytes_consumed) or error
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= MAX_REMAINING_LENGTH_BYTES {
            return Err(DecodeError::InvalidRemainingLength);
        }
        if pos >= buf.len() {
            return Err(DecodeError::InsufficientData);
        }

        let byte = buf[pos];
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            break;
        }

        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Write a Variable Byte Integer to buffer
/// Returns bytes written
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut count = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            break;
        }
    }
    Ok(count)
}

/// Calculate the number of bytes needed to encode a Variable Byte Integer
#[inline]
pub fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}

/// A single MQTT control packet as it travels on the wire.
///
/// Inbound packets are produced by [`read_packet`] or [`Decoder`] and read
/// field by field; outbound packets are built with [`Packet::new`] and the
/// `put_*` writers, then serialized with [`Packet::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    flags: u8,
    payload: BytesMut,
    pos: usize,
}

impl Packet {
    /// Start an empty outbound packet
    pub fn new(packet_type: PacketType, flags: u8) -> Self {
        Self::with_capacity(packet_type, flags, 0)
    }

    pub fn with_capacity(packet_type: PacketType, flags: u8, capacity: usize) -> Self {
        Self {
            packet_type,
            flags: flags & 0x0F,
            payload: BytesMut::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Wrap a received payload, cursor at the start
    pub fn from_parts(packet_type: PacketType, flags: u8, payload: BytesMut) -> Self {
        Self {
            packet_type,
            flags: flags & 0x0F,
            payload,
            pos: 0,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn remaining_length(&self) -> usize {
        self.payload.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Current read position inside the payload
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left between the cursor and the end of the payload
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    fn take(&mut self, len: usize) -> Result<&[u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::InsufficientData);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.payload[start..self.pos])
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Read a Two Byte Integer (u16 big-endian)
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a length-prefixed byte string
    pub fn read_binary(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.read_u16()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u16()? as usize;
        let raw = self.take(len)?;
        let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(s.to_owned())
    }

    /// Consume everything after the cursor (the PUBLISH content field)
    pub fn read_remaining(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(&self.payload[self.pos..]);
        self.pos = self.payload.len();
        rest
    }

    pub fn put_u8(&mut self, v: u8) {
        self.payload.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.payload.put_u16(v);
    }

    /// Write a length-prefixed byte string
    pub fn put_binary(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        if data.len() > u16::MAX as usize {
            return Err(EncodeError::StringTooLong);
        }
        self.payload.put_u16(data.len() as u16);
        self.payload.put_slice(data);
        Ok(())
    }

    pub fn put_string(&mut self, s: &str) -> Result<(), EncodeError> {
        self.put_binary(s.as_bytes())
    }

    /// Append raw bytes with no length prefix
    pub fn put_remaining(&mut self, data: &[u8]) {
        self.payload.put_slice(data);
    }

    /// Serialize the fixed header and payload into `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = self.payload.len();
        if remaining_length > MAX_REMAINING_LENGTH {
            return Err(EncodeError::PacketTooLarge);
        }
        buf.reserve(1 + variable_int_len(remaining_length as u32) + remaining_length);
        buf.put_u8(((self.packet_type as u8) << 4) | self.flags);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}
