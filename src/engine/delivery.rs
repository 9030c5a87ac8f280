//! Outbound delivery draining

use tracing::{trace, warn};

use super::{Engine, EngineError};
use crate::codec::Packet;
use crate::protocol::{Publish, QoS};
use crate::session::{ConnectionId, Direction, PublishState, QueueState, SessionState};
use crate::store::StoreError;

impl Engine {
    /// One pass over `conn`'s queue: build a PUBLISH for every outbound
    /// delivery still waiting to be published, in queue order.
    ///
    /// QoS 0 deliveries are retired as soon as their PUBLISH is built. QoS 1
    /// and 2 deliveries get a fresh packet id and stay queued, awaiting
    /// PUBACK or PUBREC. Entries in any other state are left alone. A session
    /// that has not completed CONNECT gets nothing.
    pub fn drain(&mut self, conn: ConnectionId) -> Result<Vec<Packet>, EngineError> {
        let session = self
            .sessions
            .get_mut(conn)
            .ok_or(EngineError::UnknownSession(conn))?;
        if session.state != SessionState::Connected {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut released = false;
        let mut i = 0;
        while i < session.queue.len() {
            let entry = &session.queue[i];
            if entry.direction != Direction::Outbound
                || entry.publish_state != PublishState::WaitToPublish
            {
                i += 1;
                continue;
            }

            let handle = entry.message;
            let qos = entry.qos;
            let message = self
                .store
                .get(handle)
                .ok_or(StoreError::UnknownHandle(handle))?;

            let packet_id = match qos {
                QoS::AtMostOnce => None,
                QoS::AtLeastOnce | QoS::ExactlyOnce => match session.next_packet_id() {
                    Some(id) => Some(id),
                    None => {
                        warn!("{} has no free packet id, delivery deferred", conn);
                        break;
                    }
                },
            };

            let publish = Publish {
                dup: false,
                qos,
                retain: false,
                topic: message.topic.clone(),
                packet_id,
                content: message.content.clone(),
            };
            out.push(publish.encode()?);
            trace!("{} -> PUBLISH {} ({:?})", conn, publish.topic, qos);

            match qos {
                QoS::AtMostOnce => {
                    session.queue.remove(i);
                    self.store.release(handle)?;
                    released = true;
                }
                QoS::AtLeastOnce | QoS::ExactlyOnce => {
                    let entry = &mut session.queue[i];
                    entry.packet_id = packet_id;
                    entry.queue_state = QueueState::Inflight;
                    entry.publish_state = if qos == QoS::AtLeastOnce {
                        PublishState::WaitForPubAck
                    } else {
                        PublishState::WaitForPubRec
                    };
                    i += 1;
                }
            }
        }

        if released {
            trace!("{:?}", self.stats());
        }
        Ok(out)
    }
}
