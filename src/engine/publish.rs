//! PUBLISH handling and fan-out

use tracing::{debug, trace, warn};

use super::{reject, Dispatch, Engine, EngineError, Wake};
use crate::codec::Packet;
use crate::protocol::{DecodeError, PacketIdAck, PacketType, Publish, QoS};
use crate::session::{ConnectionId, DeliveryEntry, PublishState};
use crate::store::{MessageHandle, StoreError, TopicMessage};
use crate::topic::{validate_topic_name_with_max_levels, Subscriber};

impl Engine {
    /// Handle PUBLISH
    ///
    /// QoS 0 and 1 are fanned out immediately; the QoS 1 PUBACK is the
    /// dispatch reply, so the transport writes it before any recipient is
    /// woken. QoS 2 is parked on the publisher's own queue until PUBREL.
    pub(super) fn handle_publish(
        &mut self,
        conn: ConnectionId,
        packet: &mut Packet,
    ) -> Result<Dispatch, EngineError> {
        let publish = match Publish::decode(packet) {
            Ok(p) => p,
            Err(e) => return reject(conn, PacketType::Publish, e),
        };
        trace!(
            "{} PUBLISH {} ({:?}, {} bytes)",
            conn,
            publish.topic,
            publish.qos,
            publish.content.len()
        );

        if let Err(reason) =
            validate_topic_name_with_max_levels(&publish.topic, self.config.max_topic_levels)
        {
            warn!("{} sent invalid PUBLISH topic: {}", conn, reason);
            return Ok(Dispatch::close());
        }

        let qos = publish.qos;
        let packet_id = publish.packet_id;
        let message = TopicMessage {
            topic: publish.topic,
            content: publish.content,
            qos,
            dup: publish.dup,
            retain: publish.retain,
            packet_id,
        };

        match qos {
            QoS::AtMostOnce => {
                let wake = self.publish_now(message)?;
                Ok(Dispatch::none().with_wake(wake))
            }
            QoS::AtLeastOnce => {
                let packet_id = packet_id.ok_or(DecodeError::MalformedPacket("missing packet id"))?;
                let wake = self.publish_now(message)?;
                Ok(Dispatch::reply(PacketIdAck::puback(packet_id).encode()).with_wake(wake))
            }
            QoS::ExactlyOnce => {
                let packet_id = packet_id.ok_or(DecodeError::MalformedPacket("missing packet id"))?;
                let session = self
                    .sessions
                    .get_mut(conn)
                    .ok_or(EngineError::UnknownSession(conn))?;

                if session
                    .find_delivery(packet_id, PublishState::WaitForPubRel)
                    .is_some()
                {
                    debug!("{} resent QoS 2 PUBLISH {}", conn, packet_id);
                    return Ok(Dispatch::reply(PacketIdAck::pubrec(packet_id).encode()));
                }

                let handle = self.store.insert(message);
                self.store.retain(handle)?;
                session
                    .queue
                    .push_back(DeliveryEntry::inbound_qos2(handle, packet_id));
                trace!("{:?}", self.stats());
                Ok(Dispatch::reply(PacketIdAck::pubrec(packet_id).encode()))
            }
        }
    }

    /// Store a message, fan it out, and drop it again if nobody matched
    fn publish_now(&mut self, message: TopicMessage) -> Result<Wake, EngineError> {
        let handle = self.store.insert(message);
        let wake = self.fan_out(handle)?;
        self.store.discard_if_unreferenced(handle);
        trace!("{:?}", self.stats());
        Ok(wake)
    }

    /// Queue one outbound delivery per matching (filter, subscriber) pair,
    /// taking one message reference per delivery. Delivery QoS is the lower
    /// of the published and the granted QoS.
    pub(super) fn fan_out(&mut self, handle: MessageHandle) -> Result<Wake, EngineError> {
        let message = self
            .store
            .get(handle)
            .ok_or(StoreError::UnknownHandle(handle))?;
        let published_qos = message.qos;

        let mut targets: Vec<Subscriber> = Vec::new();
        self.index
            .for_each_match(&message.topic, |_, subscriber| targets.push(*subscriber));

        let mut wake = Wake::new();
        for subscriber in targets {
            let Some(session) = self.sessions.get_mut(subscriber.conn) else {
                continue;
            };
            self.store.retain(handle)?;
            session.queue.push_back(DeliveryEntry::outbound(
                handle,
                published_qos.min(subscriber.qos),
            ));
            if !wake.contains(&subscriber.conn) {
                wake.push(subscriber.conn);
            }
        }

        if !wake.is_empty() {
            debug!("{} fanned out to {} sessions", handle, wake.len());
        }
        Ok(wake)
    }
}
