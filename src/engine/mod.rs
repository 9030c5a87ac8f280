//! Broker Engine
//!
//! The context object owning the message store, the subscription index and
//! the session table. The transport hands it one complete inbound packet at
//! a time ([`Engine::handle_packet`]) and asks it for the outbound packets a
//! session is owed ([`Engine::drain`]). Nothing here performs I/O.
//!
//! Handlers are grouped by packet family:
//! - `connect`: CONNECT, PINGREQ, DISCONNECT
//! - `publish`: PUBLISH and fan-out
//! - `qos`: PUBACK, PUBREC, PUBREL, PUBCOMP
//! - `subscribe`: SUBSCRIBE, UNSUBSCRIBE
//! - `delivery`: outbound queue draining

mod connect;
mod delivery;
mod publish;
mod qos;
mod subscribe;


use std::fmt;
use std::net::IpAddr;

use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::codec::Packet;
use crate::protocol::{DecodeError, EncodeError, PacketType, ProtocolError, PROTOCOL_MAX_LEVEL};
use crate::session::{ConnectionId, SessionState, SessionTable, Teardown};
use crate::store::{MessageStore, StoreError};
use crate::topic::{SubscriptionIndex, DEFAULT_MAX_TOPIC_LEVELS};

/// Protocol options the engine enforces
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Highest CONNECT protocol level accepted
    pub max_protocol_level: u8,
    /// Close after answering an unsupported protocol level
    pub close_on_unsupported_protocol: bool,
    /// Deepest topic name or filter accepted (0 = unlimited)
    pub max_topic_levels: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_protocol_level: PROTOCOL_MAX_LEVEL,
            close_on_unsupported_protocol: true,
            max_topic_levels: DEFAULT_MAX_TOPIC_LEVELS,
        }
    }
}

/// Engine errors. Every one of them is fatal to the connection it was
/// raised for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed packet or protocol violation
    Protocol(ProtocolError),
    /// Message reference bookkeeping broken
    Store(StoreError),
    /// No session for the connection
    UnknownSession(ConnectionId),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "{}", e),
            Self::Store(e) => write!(f, "store error: {}", e),
            Self::UnknownSession(conn) => write!(f, "no session for {}", conn),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        EngineError::Protocol(e)
    }
}

impl From<DecodeError> for EngineError {
    fn from(e: DecodeError) -> Self {
        EngineError::Protocol(ProtocolError::Decode(e))
    }
}

impl From<EncodeError> for EngineError {
    fn from(e: EncodeError) -> Self {
        EngineError::Protocol(ProtocolError::Encode(e))
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

/// Sessions that gained deliveries during a dispatch
pub type Wake = SmallVec<[ConnectionId; 4]>;

/// Outcome of handling one inbound packet
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Packet to send back on the same connection, before anything else
    pub reply: Option<Packet>,
    /// Close the connection after the reply
    pub close: bool,
    /// Sessions with new outbound deliveries
    pub wake: Wake,
}

impl Dispatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn reply(packet: Packet) -> Self {
        Self {
            reply: Some(packet),
            ..Default::default()
        }
    }

    pub fn close() -> Self {
        Self {
            close: true,
            ..Default::default()
        }
    }

    pub fn reply_and_close(packet: Packet) -> Self {
        Self {
            reply: Some(packet),
            close: true,
            ..Default::default()
        }
    }

    pub fn with_wake(mut self, wake: Wake) -> Self {
        self.wake = wake;
        self
    }
}

/// Snapshot of engine occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub sessions: usize,
    pub filters: usize,
    pub messages: usize,
    pub queued_deliveries: usize,
}

/// Broker state shared by every connection
#[derive(Debug, Default)]
pub struct Engine {
    config: EngineConfig,
    store: MessageStore,
    index: SubscriptionIndex,
    sessions: SessionTable,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn index(&self) -> &SubscriptionIndex {
        &self.index
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            sessions: self.sessions.len(),
            filters: self.index.len(),
            messages: self.store.len(),
            queued_deliveries: self.sessions.queued_deliveries(),
        }
    }

    /// Register a freshly accepted connection
    pub fn add_session(&mut self, conn: ConnectionId, address: Option<IpAddr>, port: Option<u16>) {
        self.sessions.add(conn, address, port);
    }

    /// Tear a session down: release every queued delivery and unregister it
    /// from every filter it subscribed. A failed release is reported only
    /// after both steps have run to completion.
    pub fn remove_session(&mut self, conn: ConnectionId) -> Result<Option<Teardown>, EngineError> {
        let Some(mut teardown) = self.sessions.remove(conn, &mut self.store) else {
            return Ok(None);
        };

        for filter in &teardown.filters {
            self.index.unsubscribe(filter, conn);
        }

        // No retransmission: a handshake still open here was never finished
        if teardown.inflight > 0 {
            warn!(
                "{} closed with {} unfinished QoS handshakes",
                conn, teardown.inflight
            );
        }
        trace!("{:?}", self.stats());

        match teardown.release_error.take() {
            Some(e) => Err(e.into()),
            None => Ok(Some(teardown)),
        }
    }

    /// Dispatch one complete inbound packet from `conn`
    pub fn handle_packet(
        &mut self,
        conn: ConnectionId,
        mut packet: Packet,
    ) -> Result<Dispatch, EngineError> {
        let state = self
            .sessions
            .get(conn)
            .map(|s| s.state)
            .ok_or(EngineError::UnknownSession(conn))?;
        let packet_type = packet.packet_type();
        trace!("{} <- {}", conn, packet_type);

        match (state, packet_type) {
            (SessionState::AwaitingConnect, PacketType::Connect) => {
                self.handle_connect(conn, &mut packet)
            }
            (SessionState::AwaitingConnect, _) => Err(ProtocolError::ProtocolViolation(
                "first packet must be CONNECT",
            )
            .into()),
            (_, PacketType::Connect) => {
                Err(ProtocolError::ProtocolViolation("second CONNECT").into())
            }
            (_, PacketType::Publish) => self.handle_publish(conn, &mut packet),
            (_, PacketType::PubAck) => self.handle_puback(conn, &mut packet),
            (_, PacketType::PubRec) => self.handle_pubrec(conn, &mut packet),
            (_, PacketType::PubRel) => self.handle_pubrel(conn, &mut packet),
            (_, PacketType::PubComp) => self.handle_pubcomp(conn, &mut packet),
            (_, PacketType::Subscribe) => self.handle_subscribe(conn, &mut packet),
            (_, PacketType::Unsubscribe) => self.handle_unsubscribe(conn, &mut packet),
            (_, PacketType::PingReq) => Ok(self.handle_pingreq(conn)),
            (_, PacketType::Disconnect) => Ok(self.handle_disconnect(conn)),
            (
                _,
                PacketType::ConnAck
                | PacketType::SubAck
                | PacketType::UnsubAck
                | PacketType::PingResp,
            ) => Err(ProtocolError::ProtocolViolation("server-only packet type").into()),
        }
    }
}

/// Validation failures (reserved flag bits, QoS 3) close the connection
/// without a reply. Any other decode failure is a malformed packet.
fn reject(
    conn: ConnectionId,
    packet_type: PacketType,
    err: DecodeError,
) -> Result<Dispatch, EngineError> {
    match err {
        DecodeError::InvalidFlags | DecodeError::InvalidQoS(_) => {
            warn!("{} sent invalid {}: {}", conn, packet_type, err);
            Ok(Dispatch::close())
        }
        e => Err(e.into()),
    }
}
