//! SUBSCRIBE and UNSUBSCRIBE handling

use tracing::{debug, trace};

use super::{reject, Dispatch, Engine, EngineError};
use crate::codec::Packet;
use crate::protocol::{PacketIdAck, PacketType, SubAck, Subscribe, Unsubscribe, SUBACK_FAILURE};
use crate::session::ConnectionId;
use crate::topic::validate_topic_filter_with_max_levels;

impl Engine {
    /// Handle SUBSCRIBE
    ///
    /// The whole payload is parsed before anything is registered, so a QoS 3
    /// anywhere in the request closes the connection with nothing applied.
    pub(super) fn handle_subscribe(
        &mut self,
        conn: ConnectionId,
        packet: &mut Packet,
    ) -> Result<Dispatch, EngineError> {
        let subscribe = match Subscribe::decode(packet) {
            Ok(s) => s,
            Err(e) => return reject(conn, PacketType::Subscribe, e),
        };

        let max_levels = self.config.max_topic_levels;
        let session = self
            .sessions
            .get_mut(conn)
            .ok_or(EngineError::UnknownSession(conn))?;

        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        for sub in subscribe.subscriptions {
            if let Err(reason) = validate_topic_filter_with_max_levels(&sub.filter, max_levels) {
                debug!("{} rejected filter: {}", conn, reason);
                return_codes.push(SUBACK_FAILURE);
                continue;
            }

            debug!("{} subscribed to {} ({:?})", conn, sub.filter, sub.qos);
            self.index.subscribe(&sub.filter, conn, sub.qos);
            session.filters.insert(sub.filter);
            return_codes.push(sub.qos as u8);
        }
        trace!("{:?}", self.stats());

        Ok(Dispatch::reply(
            SubAck {
                packet_id: subscribe.packet_id,
                return_codes,
            }
            .encode(),
        ))
    }

    /// Handle UNSUBSCRIBE
    pub(super) fn handle_unsubscribe(
        &mut self,
        conn: ConnectionId,
        packet: &mut Packet,
    ) -> Result<Dispatch, EngineError> {
        let unsubscribe = Unsubscribe::decode(packet)?;

        let session = self
            .sessions
            .get_mut(conn)
            .ok_or(EngineError::UnknownSession(conn))?;

        for filter in &unsubscribe.filters {
            if self.index.unsubscribe(filter, conn) {
                debug!("{} unsubscribed from {}", conn, filter);
            }
            session.filters.remove(filter);
        }
        trace!("{:?}", self.stats());

        Ok(Dispatch::reply(
            PacketIdAck::unsuback(unsubscribe.packet_id).encode(),
        ))
    }
}
