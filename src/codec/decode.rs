//! MQTT Packet Decoder
//!
//! Two entry points over the same framing rules: [`read_packet`] pulls one
//! packet off an async byte stream, and [`Decoder`] splits packets out of a
//! buffer that may hold partial data.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{read_variable_int, Packet, MAX_REMAINING_LENGTH, MAX_REMAINING_LENGTH_BYTES};
use crate::protocol::{DecodeError, PacketType};

fn parse_header(first_byte: u8) -> Result<(PacketType, u8), DecodeError> {
    let type_bits = first_byte >> 4;
    let packet_type =
        PacketType::from_u8(type_bits).ok_or(DecodeError::InvalidPacketType(type_bits))?;
    Ok((packet_type, first_byte & 0x0F))
}

/// Failure while pulling a packet off a byte stream
#[derive(Debug)]
pub enum ReadError {
    /// Transport error
    Io(std::io::Error),
    /// Framing error, including a stream that closed mid-packet
    Decode(DecodeError),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Io(e) => write!(f, "IO error: {}", e),
            ReadError::Decode(e) => write!(f, "Decode error: {}", e),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<DecodeError> for ReadError {
    fn from(e: DecodeError) -> Self {
        ReadError::Decode(e)
    }
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ReadError::Decode(DecodeError::UnexpectedEof)
        } else {
            ReadError::Io(e)
        }
    }
}

/// Read exactly one packet from `reader`.
///
/// Reads the leading byte, then the remaining length one byte at a time,
/// then exactly `remaining length` payload bytes. Returns `Ok(None)` when the
/// stream is closed cleanly before the first byte.
pub async fn read_packet<R>(
    reader: &mut R,
    max_packet_size: usize,
) -> Result<Option<Packet>, ReadError>
where
    R: AsyncRead + Unpin,
{
    let first_byte = match reader.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ReadError::Io(e)),
    };
    let (packet_type, flags) = parse_header(first_byte)?;

    let mut remaining_length: usize = 0;
    let mut multiplier: usize = 1;
    let mut consumed = 0;
    loop {
        if consumed == MAX_REMAINING_LENGTH_BYTES {
            return Err(DecodeError::InvalidRemainingLength.into());
        }
        let byte = reader.read_u8().await?;
        consumed += 1;
        remaining_length += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }

    if remaining_length > max_packet_size.min(MAX_REMAINING_LENGTH) {
        return Err(DecodeError::PacketTooLarge.into());
    }

    let mut payload = BytesMut::zeroed(remaining_length);
    reader.read_exact(&mut payload).await?;

    Ok(Some(Packet::from_parts(packet_type, flags, payload)))
}

/// Buffer-based packet decoder
pub struct Decoder {
    /// Maximum packet size
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed), or None until a full packet is buffered
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let (packet_type, flags) = parse_header(buf[0])?;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = BytesMut::from(&buf[1 + len_bytes..total_len]);
        Ok(Some((
            Packet::from_parts(packet_type, flags, payload),
            total_len,
        )))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
