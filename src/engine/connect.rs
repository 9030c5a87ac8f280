//! CONNECT, PINGREQ and DISCONNECT handling

use tracing::{debug, info, warn};

use super::{reject, Dispatch, Engine, EngineError};
use crate::codec::Packet;
use crate::protocol::{
    pingresp, ConnAck, Connect, ConnectHeader, ConnectReturnCode, PacketType, PROTOCOL_NAME,
};
use crate::session::{ConnectionId, SessionState};

impl Engine {
    /// Handle CONNECT
    pub(super) fn handle_connect(
        &mut self,
        conn: ConnectionId,
        packet: &mut Packet,
    ) -> Result<Dispatch, EngineError> {
        let header = ConnectHeader::decode(packet)?;

        if header.protocol_name != PROTOCOL_NAME {
            warn!(
                "{} sent unknown protocol name {:?}",
                conn, header.protocol_name
            );
            return Ok(Dispatch::close());
        }

        if header.protocol_level > self.config.max_protocol_level {
            warn!(
                "{} requested unsupported protocol level {}",
                conn, header.protocol_level
            );
            let connack = ConnAck::new(ConnectReturnCode::UnacceptableProtocolVersion).encode();
            return Ok(if self.config.close_on_unsupported_protocol {
                Dispatch::reply_and_close(connack)
            } else {
                Dispatch::reply(connack)
            });
        }

        let connect = match Connect::decode(packet) {
            Ok(c) => c,
            Err(e) => return reject(conn, PacketType::Connect, e),
        };

        if let Some(ref will) = connect.will {
            // Parsed for completeness; wills are never published
            debug!("{} registered will on {}", conn, will.topic);
        }

        info!(
            "{} connected as {:?} (keep alive {}s)",
            conn, connect.client_id, connect.keep_alive
        );

        self.sessions.set_identity(conn, connect.client_id);
        self.sessions
            .set_credentials(conn, connect.username, connect.password);
        self.sessions.set_state(conn, SessionState::Connected);

        Ok(Dispatch::reply(
            ConnAck::new(ConnectReturnCode::Accepted).encode(),
        ))
    }

    pub(super) fn handle_pingreq(&mut self, _conn: ConnectionId) -> Dispatch {
        Dispatch::reply(pingresp())
    }

    /// DISCONNECT only marks the session; teardown is the transport's job
    pub(super) fn handle_disconnect(&mut self, conn: ConnectionId) -> Dispatch {
        debug!("{} sent DISCONNECT", conn);
        self.sessions.set_state(conn, SessionState::Disconnected);
        Dispatch::close()
    }
}
