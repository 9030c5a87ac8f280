//! MQTT Packet bodies
//!
//! Typed views over the raw [`Packet`] frame. Each body knows how to read
//! itself from a frame's payload cursor and how to build an outbound frame.

use bytes::Bytes;

use super::{
    connect_flags, publish_flags, ConnectReturnCode, DecodeError, EncodeError, PacketType, QoS,
};
use crate::codec::Packet;

/// Variable header of a CONNECT, up to and including the protocol level.
///
/// Parsed separately from the rest of the packet so the handler can reject
/// a foreign protocol name or an unsupported level before touching the
/// remaining fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectHeader {
    pub protocol_name: String,
    pub protocol_level: u8,
}

impl ConnectHeader {
    pub fn decode(packet: &mut Packet) -> Result<Self, DecodeError> {
        let protocol_name = packet.read_string()?;
        let protocol_level = packet.read_u8()?;
        Ok(Self {
            protocol_name,
            protocol_level,
        })
    }
}

/// Will message configuration (parsed, never published)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNECT fields following the protocol level
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connect {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    /// Decode the connect flags and payload. The cursor must sit right after
    /// the protocol level (see [`ConnectHeader::decode`]).
    pub fn decode(packet: &mut Packet) -> Result<Self, DecodeError> {
        let flags = packet.read_u8()?;

        // Reserved bit must be 0
        if flags & connect_flags::RESERVED != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = packet.read_u16()?;
        let client_id = packet.read_string()?;

        let will = if flags & connect_flags::WILL != 0 {
            let will_qos = (flags & connect_flags::WILL_QOS) >> 3;
            let topic = packet.read_string()?;
            let message = packet.read_binary()?;
            Some(Will {
                topic,
                message,
                qos: QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?,
                retain: flags & connect_flags::WILL_RETAIN != 0,
            })
        } else {
            None
        };

        let username = if flags & connect_flags::USERNAME != 0 {
            Some(packet.read_string()?)
        } else {
            None
        };

        let password = if flags & connect_flags::PASSWORD != 0 {
            Some(packet.read_binary()?)
        } else {
            None
        };

        Ok(Self {
            clean_session: flags & connect_flags::CLEAN_SESSION != 0,
            keep_alive,
            client_id,
            will,
            username,
            password,
        })
    }

    /// Build a complete CONNECT frame (used by clients and tests)
    pub fn encode(&self, protocol_level: u8) -> Result<Packet, EncodeError> {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= connect_flags::CLEAN_SESSION;
        }
        if let Some(ref will) = self.will {
            flags |= connect_flags::WILL | ((will.qos as u8) << 3);
            if will.retain {
                flags |= connect_flags::WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= connect_flags::USERNAME;
        }
        if self.password.is_some() {
            flags |= connect_flags::PASSWORD;
        }

        let mut packet = Packet::new(PacketType::Connect, 0);
        packet.put_string(super::PROTOCOL_NAME)?;
        packet.put_u8(protocol_level);
        packet.put_u8(flags);
        packet.put_u16(self.keep_alive);
        packet.put_string(&self.client_id)?;
        if let Some(ref will) = self.will {
            packet.put_string(&will.topic)?;
            packet.put_binary(&will.message)?;
        }
        if let Some(ref username) = self.username {
            packet.put_string(username)?;
        }
        if let Some(ref password) = self.password {
            packet.put_binary(password)?;
        }
        Ok(packet)
    }
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    pub fn new(return_code: ConnectReturnCode) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }

    pub fn encode(&self) -> Packet {
        let mut packet = Packet::with_capacity(PacketType::ConnAck, 0, 2);
        packet.put_u8(self.session_present as u8);
        packet.put_u8(self.return_code as u8);
        packet
    }

    pub fn decode(packet: &mut Packet) -> Result<Self, DecodeError> {
        let ack_flags = packet.read_u8()?;
        let code = packet.read_u8()?;
        Ok(Self {
            session_present: ack_flags & 0x01 != 0,
            return_code: ConnectReturnCode::from_u8(code)
                .ok_or(DecodeError::MalformedPacket("unknown CONNACK return code"))?,
        })
    }
}

/// PUBLISH packet (bidirectional)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present only for QoS > 0
    pub packet_id: Option<u16>,
    pub content: Bytes,
}

impl Publish {
    pub fn decode(packet: &mut Packet) -> Result<Self, DecodeError> {
        let flags = packet.flags();
        let qos_bits = (flags & publish_flags::QOS) >> 1;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        let topic = packet.read_string()?;
        let packet_id = if qos != QoS::AtMostOnce {
            Some(packet.read_u16()?)
        } else {
            None
        };
        let content = packet.read_remaining();

        Ok(Self {
            dup: flags & publish_flags::DUP != 0,
            qos,
            retain: flags & publish_flags::RETAIN != 0,
            topic,
            packet_id,
            content,
        })
    }

    pub fn encode(&self) -> Result<Packet, EncodeError> {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= publish_flags::DUP;
        }
        if self.retain {
            flags |= publish_flags::RETAIN;
        }

        let capacity = 2 + self.topic.len() + 2 + self.content.len();
        let mut packet = Packet::with_capacity(PacketType::Publish, flags, capacity);
        packet.put_string(&self.topic)?;
        if self.qos != QoS::AtMostOnce {
            packet.put_u16(self.packet_id.unwrap_or_default());
        }
        packet.put_remaining(&self.content);
        Ok(packet)
    }
}

/// Acknowledgement carrying only a packet identifier
/// (PUBACK, PUBREC, PUBREL, PUBCOMP, UNSUBACK)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketIdAck {
    pub packet_type: PacketType,
    pub packet_id: u16,
}

impl PacketIdAck {
    pub fn puback(packet_id: u16) -> Self {
        Self {
            packet_type: PacketType::PubAck,
            packet_id,
        }
    }

    pub fn pubrec(packet_id: u16) -> Self {
        Self {
            packet_type: PacketType::PubRec,
            packet_id,
        }
    }

    pub fn pubrel(packet_id: u16) -> Self {
        Self {
            packet_type: PacketType::PubRel,
            packet_id,
        }
    }

    pub fn pubcomp(packet_id: u16) -> Self {
        Self {
            packet_type: PacketType::PubComp,
            packet_id,
        }
    }

    pub fn unsuback(packet_id: u16) -> Self {
        Self {
            packet_type: PacketType::UnsubAck,
            packet_id,
        }
    }

    pub fn decode(packet: &mut Packet) -> Result<Self, DecodeError> {
        Ok(Self {
            packet_type: packet.packet_type(),
            packet_id: packet.read_u16()?,
        })
    }

    pub fn encode(&self) -> Packet {
        // PUBREL carries the fixed header flags 0010 [MQTT-3.6.1-1]
        let flags = if self.packet_type == PacketType::PubRel {
            0x02
        } else {
            0x00
        };
        let mut packet = Packet::with_capacity(self.packet_type, flags, 2);
        packet.put_u16(self.packet_id);
        packet
    }
}

/// Subscription request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

impl Subscribe {
    /// Reads (filter, QoS) pairs until the payload is exhausted. Any QoS
    /// above 2 fails the whole request.
    pub fn decode(packet: &mut Packet) -> Result<Self, DecodeError> {
        let packet_id = packet.read_u16()?;
        let mut subscriptions = Vec::new();
        while packet.has_remaining() {
            let filter = packet.read_string()?;
            let requested = packet.read_u8()?;
            let qos = QoS::from_u8(requested).ok_or(DecodeError::InvalidQoS(requested))?;
            subscriptions.push(Subscription { filter, qos });
        }
        Ok(Self {
            packet_id,
            subscriptions,
        })
    }

    pub fn encode(&self) -> Result<Packet, EncodeError> {
        let mut packet = Packet::new(PacketType::Subscribe, 0x02);
        packet.put_u16(self.packet_id);
        for sub in &self.subscriptions {
            packet.put_string(&sub.filter)?;
            packet.put_u8(sub.qos as u8);
        }
        Ok(packet)
    }
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// Granted QoS per filter, in request order
    pub return_codes: Vec<u8>,
}

impl SubAck {
    pub fn encode(&self) -> Packet {
        let mut packet =
            Packet::with_capacity(PacketType::SubAck, 0, 2 + self.return_codes.len());
        packet.put_u16(self.packet_id);
        for code in &self.return_codes {
            packet.put_u8(*code);
        }
        packet
    }

    pub fn decode(packet: &mut Packet) -> Result<Self, DecodeError> {
        let packet_id = packet.read_u16()?;
        let mut return_codes = Vec::with_capacity(packet.remaining());
        while packet.has_remaining() {
            return_codes.push(packet.read_u8()?);
        }
        Ok(Self {
            packet_id,
            return_codes,
        })
    }
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

impl Unsubscribe {
    pub fn decode(packet: &mut Packet) -> Result<Self, DecodeError> {
        let packet_id = packet.read_u16()?;
        let mut filters = Vec::new();
        while packet.has_remaining() {
            filters.push(packet.read_string()?);
        }
        Ok(Self { packet_id, filters })
    }

    pub fn encode(&self) -> Result<Packet, EncodeError> {
        let mut packet = Packet::new(PacketType::Unsubscribe, 0x02);
        packet.put_u16(self.packet_id);
        for filter in &self.filters {
            packet.put_string(filter)?;
        }
        Ok(packet)
    }
}

/// PINGRESP has no variable header or payload
pub fn pingresp() -> Packet {
    Packet::new(PacketType::PingResp, 0)
}
