//! Client Session Table
//!
//! One [`ClientSession`] per accepted connection, created before CONNECT and
//! destroyed only through [`SessionTable::remove`], which releases every
//! message reference the session still holds.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::protocol::QoS;
use crate::store::{MessageHandle, MessageStore, StoreError};

/// Transport-assigned connection identifier, never reused while the
/// process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, CONNECT not yet received
    AwaitingConnect,
    /// CONNECT accepted
    Connected,
    /// Close requested, teardown pending
    Disconnected,
}

/// Delivery queue position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Waiting,
    Inflight,
}

/// Handshake step of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    /// Outbound, PUBLISH not sent yet
    WaitToPublish,
    /// Outbound QoS 1, PUBLISH sent
    WaitForPubAck,
    /// Inbound QoS 2, PUBREC sent
    WaitForPubRel,
    /// Outbound QoS 2, PUBLISH sent
    WaitForPubRec,
    /// Outbound QoS 2, PUBREL sent
    WaitForPubComp,
}

/// Who moves the handshake forward next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Message received from this session; the broker awaits the peer
    Inbound,
    /// Message to be sent to this session; the broker drives it
    Outbound,
}

/// One pending or in-flight delivery of a stored message to one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEntry {
    pub queue_state: QueueState,
    pub publish_state: PublishState,
    /// Retransmissions performed. Nothing retransmits yet, so this stays 0.
    pub resend_count: u32,
    pub qos: QoS,
    pub direction: Direction,
    /// Inbound: publisher's id. Outbound: assigned when the PUBLISH is built.
    pub packet_id: Option<u16>,
    pub message: MessageHandle,
}

impl DeliveryEntry {
    /// Fan-out delivery waiting to be published to the session
    pub fn outbound(message: MessageHandle, qos: QoS) -> Self {
        Self {
            queue_state: QueueState::Waiting,
            publish_state: PublishState::WaitToPublish,
            resend_count: 0,
            qos,
            direction: Direction::Outbound,
            packet_id: None,
            message,
        }
    }

    /// QoS 2 message received from the session, held until PUBREL
    pub fn inbound_qos2(message: MessageHandle, packet_id: u16) -> Self {
        Self {
            queue_state: QueueState::Inflight,
            publish_state: PublishState::WaitForPubRel,
            resend_count: 0,
            qos: QoS::ExactlyOnce,
            direction: Direction::Inbound,
            packet_id: Some(packet_id),
            message,
        }
    }

    pub fn is_inflight(&self) -> bool {
        self.queue_state == QueueState::Inflight
    }
}

/// Per-connection session
#[derive(Debug)]
pub struct ClientSession {
    pub conn: ConnectionId,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub state: SessionState,
    /// Next outbound packet identifier
    next_packet_id: u16,
    /// Deliveries in arrival order
    pub queue: VecDeque<DeliveryEntry>,
    /// Filters this session is registered under
    pub filters: AHashSet<String>,
}

impl ClientSession {
    pub fn new(conn: ConnectionId, address: Option<IpAddr>, port: Option<u16>) -> Self {
        Self {
            conn,
            client_id: None,
            username: None,
            password: None,
            address,
            port,
            state: SessionState::AwaitingConnect,
            next_packet_id: 1,
            queue: VecDeque::new(),
            filters: AHashSet::new(),
        }
    }

    /// Allocate an outbound packet identifier. Wraps, skips 0 and skips ids
    /// still held by an outbound delivery. `None` when all 65535 are in use.
    pub fn next_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.outbound_id_in_use(id) {
                return Some(id);
            }
        }
        None
    }

    fn outbound_id_in_use(&self, id: u16) -> bool {
        self.queue
            .iter()
            .any(|e| e.direction == Direction::Outbound && e.packet_id == Some(id))
    }

    /// Position of the delivery with `packet_id` in exactly `state`
    pub fn find_delivery(&self, packet_id: u16, state: PublishState) -> Option<usize> {
        self.queue
            .iter()
            .position(|e| e.packet_id == Some(packet_id) && e.publish_state == state)
    }

    pub fn inflight_count(&self) -> usize {
        self.queue.iter().filter(|e| e.is_inflight()).count()
    }
}

/// What a session held when it was torn down
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Teardown {
    /// Message references released, one per queued delivery
    pub released: usize,
    /// Of those, deliveries whose handshake had started
    pub inflight: usize,
    /// Filters the session was still subscribed to
    pub filters: Vec<String>,
    /// First failed release, reported after every other delivery was released
    pub release_error: Option<StoreError>,
}

/// Connection id -> session
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: AHashMap<ConnectionId, ClientSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session awaiting CONNECT. No-op if `conn` already exists.
    pub fn add(&mut self, conn: ConnectionId, address: Option<IpAddr>, port: Option<u16>) {
        self.sessions
            .entry(conn)
            .or_insert_with(|| ClientSession::new(conn, address, port));
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&ClientSession> {
        self.sessions.get(&conn)
    }

    pub fn get_mut(&mut self, conn: ConnectionId) -> Option<&mut ClientSession> {
        self.sessions.get_mut(&conn)
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.sessions.contains_key(&conn)
    }

    pub fn set_identity(&mut self, conn: ConnectionId, client_id: String) {
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.client_id = Some(client_id);
        }
    }

    pub fn set_credentials(
        &mut self,
        conn: ConnectionId,
        username: Option<String>,
        password: Option<Bytes>,
    ) {
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.username = username;
            session.password = password;
        }
    }

    pub fn set_state(&mut self, conn: ConnectionId, state: SessionState) {
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.state = state;
        }
    }

    /// Destroy a session, releasing the message reference of every queued
    /// delivery. Returns `None` if the session does not exist.
    ///
    /// A failed release does not stop the others; the first failure is kept
    /// in [`Teardown::release_error`]. Subscription index cleanup is left to
    /// the caller, using the returned filter list.
    pub fn remove(&mut self, conn: ConnectionId, store: &mut MessageStore) -> Option<Teardown> {
        let session = self.sessions.remove(&conn)?;

        let mut teardown = Teardown {
            filters: session.filters.into_iter().collect(),
            ..Default::default()
        };
        for entry in session.queue {
            if entry.is_inflight() {
                teardown.inflight += 1;
            }
            match store.release(entry.message) {
                Ok(_) => teardown.released += 1,
                Err(e) => {
                    warn!("{} teardown: {}", conn, e);
                    teardown.release_error.get_or_insert(e);
                }
            }
        }

        debug!(
            "{} removed ({} deliveries released)",
            conn, teardown.released
        );
        Some(teardown)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Total deliveries queued across all sessions
    pub fn queued_deliveries(&self) -> usize {
        self.sessions.values().map(|s| s.queue.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TopicMessage;
    use pretty_assertions::assert_eq;

    fn stored(store: &mut MessageStore, refs: usize) -> MessageHandle {
        let h = store.insert(TopicMessage {
            topic: "t".into(),
            content: Bytes::new(),
            qos: QoS::AtLeastOnce,
            dup: false,
            retain: false,
            packet_id: None,
        });
        for _ in 0..refs {
            store.retain(h).unwrap();
        }
        h
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut table = SessionTable::new();
        table.add(ConnectionId(1), None, Some(1000));
        table.set_identity(ConnectionId(1), "client".into());
        table.add(ConnectionId(1), None, Some(2000));

        let session = table.get(ConnectionId(1)).unwrap();
        assert_eq!(session.client_id.as_deref(), Some("client"));
        assert_eq!(session.port, Some(1000));
        assert_eq!(session.state, SessionState::AwaitingConnect);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_setters_ignore_unknown_session() {
        let mut table = SessionTable::new();
        table.set_identity(ConnectionId(9), "x".into());
        table.set_credentials(ConnectionId(9), Some("u".into()), None);
        table.set_state(ConnectionId(9), SessionState::Connected);
        assert!(table.is_empty());
    }

    #[test]
    fn test_packet_ids_start_at_one_and_wrap() {
        let mut session = ClientSession::new(ConnectionId(1), None, None);
        assert_eq!(session.next_packet_id(), Some(1));
        assert_eq!(session.next_packet_id(), Some(2));

        session.next_packet_id = u16::MAX;
        assert_eq!(session.next_packet_id(), Some(u16::MAX));
        assert_eq!(session.next_packet_id(), Some(1));
    }

    #[test]
    fn test_packet_ids_skip_ids_in_use() {
        let mut store = MessageStore::new();
        let h = stored(&mut store, 1);
        let mut session = ClientSession::new(ConnectionId(1), None, None);
        let mut entry = DeliveryEntry::outbound(h, QoS::AtLeastOnce);
        entry.packet_id = Some(1);
        session.queue.push_back(entry);
        // Inbound ids live in the peer's id space
        session.queue.push_back(DeliveryEntry::inbound_qos2(h, 2));

        assert_eq!(session.next_packet_id(), Some(2));
    }

    #[test]
    fn test_find_delivery_is_state_gated() {
        let mut store = MessageStore::new();
        let h = stored(&mut store, 1);
        let mut session = ClientSession::new(ConnectionId(1), None, None);
        session.queue.push_back(DeliveryEntry::inbound_qos2(h, 7));

        assert_eq!(session.find_delivery(7, PublishState::WaitForPubRel), Some(0));
        assert_eq!(session.find_delivery(7, PublishState::WaitForPubComp), None);
        assert_eq!(session.find_delivery(8, PublishState::WaitForPubRel), None);
    }

    #[test]
    fn test_remove_releases_every_delivery() {
        let mut store = MessageStore::new();
        let shared = stored(&mut store, 3);
        let own = stored(&mut store, 1);

        let mut table = SessionTable::new();
        table.add(ConnectionId(1), None, None);
        let session = table.get_mut(ConnectionId(1)).unwrap();
        session.queue.push_back(DeliveryEntry::outbound(shared, QoS::AtMostOnce));
        session.queue.push_back(DeliveryEntry::inbound_qos2(own, 4));
        session.filters.insert("a/#".into());

        let teardown = table.remove(ConnectionId(1), &mut store).unwrap();
        assert_eq!(
            teardown,
            Teardown {
                released: 2,
                inflight: 1,
                filters: vec!["a/#".to_owned()],
                release_error: None,
            }
        );
        assert_eq!(store.ref_count(shared), Some(2));
        assert!(!store.contains(own));
        assert!(table.get(ConnectionId(1)).is_none());

        assert_eq!(table.remove(ConnectionId(1), &mut store), None);
    }

    #[test]
    fn test_remove_keeps_releasing_after_a_failure() {
        let mut store = MessageStore::new();
        let before = stored(&mut store, 1);
        let unreferenced = stored(&mut store, 0);
        let after = stored(&mut store, 1);

        let mut table = SessionTable::new();
        table.add(ConnectionId(1), None, None);
        let session = table.get_mut(ConnectionId(1)).unwrap();
        session.queue.push_back(DeliveryEntry::outbound(before, QoS::AtMostOnce));
        session.queue.push_back(DeliveryEntry::outbound(unreferenced, QoS::AtMostOnce));
        session.queue.push_back(DeliveryEntry::outbound(after, QoS::AtMostOnce));
        session.filters.insert("a".into());

        let teardown = table.remove(ConnectionId(1), &mut store).unwrap();
        assert_eq!(teardown.released, 2);
        assert_eq!(
            teardown.release_error,
            Some(StoreError::ZeroReferenceCount(unreferenced))
        );
        assert_eq!(teardown.filters, vec!["a".to_owned()]);
        assert!(!store.contains(before));
        assert!(!store.contains(after));
    }
}
