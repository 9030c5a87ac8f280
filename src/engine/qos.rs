//! QoS acknowledgement handling (PUBACK, PUBREC, PUBREL, PUBCOMP)
//!
//! Every acknowledgement is matched by packet id *and* the exact publish
//! state it is valid in. An ack that matches nothing is ignored, which makes
//! duplicates harmless.

use tracing::{debug, trace};

use super::{Dispatch, Engine, EngineError};
use crate::codec::Packet;
use crate::protocol::PacketIdAck;
use crate::session::{ConnectionId, DeliveryEntry, PublishState, QueueState};

impl Engine {
    /// Remove the entry matching (packet id, state) from `conn`'s queue
    fn take_delivery(
        &mut self,
        conn: ConnectionId,
        packet_id: u16,
        state: PublishState,
    ) -> Result<Option<DeliveryEntry>, EngineError> {
        let session = self
            .sessions
            .get_mut(conn)
            .ok_or(EngineError::UnknownSession(conn))?;
        Ok(session
            .find_delivery(packet_id, state)
            .and_then(|pos| session.queue.remove(pos)))
    }

    /// Handle PUBACK (QoS 1 delivery to this session completed)
    pub(super) fn handle_puback(
        &mut self,
        conn: ConnectionId,
        packet: &mut Packet,
    ) -> Result<Dispatch, EngineError> {
        let ack = PacketIdAck::decode(packet)?;
        match self.take_delivery(conn, ack.packet_id, PublishState::WaitForPubAck)? {
            Some(entry) => {
                self.store.release(entry.message)?;
                trace!("{:?}", self.stats());
            }
            None => debug!("{} PUBACK {} matches nothing", conn, ack.packet_id),
        }
        Ok(Dispatch::none())
    }

    /// Handle PUBREC (QoS 2 delivery to this session received)
    pub(super) fn handle_pubrec(
        &mut self,
        conn: ConnectionId,
        packet: &mut Packet,
    ) -> Result<Dispatch, EngineError> {
        let ack = PacketIdAck::decode(packet)?;
        let session = self
            .sessions
            .get_mut(conn)
            .ok_or(EngineError::UnknownSession(conn))?;

        let Some(pos) = session.find_delivery(ack.packet_id, PublishState::WaitForPubRec) else {
            debug!("{} PUBREC {} matches nothing", conn, ack.packet_id);
            return Ok(Dispatch::none());
        };
        if let Some(entry) = session.queue.get_mut(pos) {
            entry.publish_state = PublishState::WaitForPubComp;
            entry.queue_state = QueueState::Inflight;
        }
        Ok(Dispatch::reply(PacketIdAck::pubrel(ack.packet_id).encode()))
    }

    /// Handle PUBREL (release of a QoS 2 message this session published).
    /// Fan-out happens here, exactly once per held message.
    pub(super) fn handle_pubrel(
        &mut self,
        conn: ConnectionId,
        packet: &mut Packet,
    ) -> Result<Dispatch, EngineError> {
        let ack = PacketIdAck::decode(packet)?;
        let Some(entry) = self.take_delivery(conn, ack.packet_id, PublishState::WaitForPubRel)?
        else {
            debug!("{} PUBREL {} matches nothing", conn, ack.packet_id);
            return Ok(Dispatch::none());
        };

        let wake = self.fan_out(entry.message)?;
        self.store.release(entry.message)?;
        trace!("{:?}", self.stats());

        Ok(Dispatch::reply(PacketIdAck::pubcomp(ack.packet_id).encode()).with_wake(wake))
    }

    /// Handle PUBCOMP (QoS 2 delivery to this session completed)
    pub(super) fn handle_pubcomp(
        &mut self,
        conn: ConnectionId,
        packet: &mut Packet,
    ) -> Result<Dispatch, EngineError> {
        let ack = PacketIdAck::decode(packet)?;
        match self.take_delivery(conn, ack.packet_id, PublishState::WaitForPubComp)? {
            Some(entry) => {
                self.store.release(entry.message)?;
                trace!("{:?}", self.stats());
            }
            None => debug!("{} PUBCOMP {} matches nothing", conn, ack.packet_id),
        }
        Ok(Dispatch::none())
    }
}
