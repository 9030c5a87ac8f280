//! Integration Tests for IoTBroker
//!
//! These tests run a real broker on a loopback socket, connect raw MQTT
//! clients to it, and validate the protocol flows end to end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use iotbroker::broker::{Broker, BrokerConfig};
use iotbroker::codec::{read_packet, Packet, MAX_REMAINING_LENGTH};
use iotbroker::engine::EngineStats;
use iotbroker::protocol::{
    ConnAck, Connect, ConnectReturnCode, PacketIdAck, PacketType, Publish, QoS, SubAck,
    Subscribe, Subscription, Unsubscribe,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a broker on an ephemeral loopback port
async fn start_broker(config: BrokerConfig) -> (Arc<Broker>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Arc::new(Broker::new(config));
    let serving = broker.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (broker, addr)
}

async fn default_broker() -> (Arc<Broker>, SocketAddr) {
    start_broker(BrokerConfig::default()).await
}

/// Poll the engine until `check` holds or the timeout passes
async fn wait_for_stats<F>(broker: &Broker, check: F) -> EngineStats
where
    F: Fn(&EngineStats) -> bool,
{
    let engine = broker.engine();
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let stats = engine.lock().stats();
        if check(&stats) || tokio::time::Instant::now() > deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Helper struct for MQTT client operations in tests
struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self { stream }
    }

    async fn send(&mut self, packet: &Packet) {
        let bytes = packet.to_bytes().expect("Failed to encode");
        self.stream.write_all(&bytes).await.expect("Failed to write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Failed to write");
    }

    /// Next packet, or None on EOF, error or timeout
    async fn recv(&mut self) -> Option<Packet> {
        match timeout(
            RECV_TIMEOUT,
            read_packet(&mut self.stream, MAX_REMAINING_LENGTH),
        )
        .await
        {
            Ok(Ok(packet)) => packet,
            _ => None,
        }
    }

    async fn expect(&mut self, packet_type: PacketType) -> Packet {
        match self.recv().await {
            Some(p) if p.packet_type() == packet_type => p,
            other => panic!("Expected {}, got {:?}", packet_type, other),
        }
    }

    /// True if the broker closed the connection
    async fn closed(&mut self) -> bool {
        self.recv().await.is_none()
    }

    async fn mqtt_connect(&mut self, client_id: &str) -> ConnAck {
        let connect = Connect {
            clean_session: true,
            keep_alive: 60,
            client_id: client_id.to_string(),
            ..Default::default()
        };
        self.send(&connect.encode(4).unwrap()).await;
        let mut packet = self.expect(PacketType::ConnAck).await;
        ConnAck::decode(&mut packet).unwrap()
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        let subscribe = Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos,
            }],
        };
        self.send(&subscribe.encode().unwrap()).await;
        let mut packet = self.expect(PacketType::SubAck).await;
        SubAck::decode(&mut packet).unwrap()
    }

    async fn publish(&mut self, topic: &str, qos: QoS, packet_id: Option<u16>, content: &'static [u8]) {
        let publish = Publish {
            qos,
            topic: topic.to_string(),
            packet_id,
            content: Bytes::from_static(content),
            ..Default::default()
        };
        self.send(&publish.encode().unwrap()).await;
    }

    async fn ack(&mut self, ack: PacketIdAck) {
        self.send(&ack.encode()).await;
    }

    async fn expect_ack(&mut self, packet_type: PacketType) -> PacketIdAck {
        let mut packet = self.expect(packet_type).await;
        PacketIdAck::decode(&mut packet).unwrap()
    }

    async fn expect_publish(&mut self) -> Publish {
        let mut packet = self.expect(PacketType::Publish).await;
        Publish::decode(&mut packet).unwrap()
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn test_connect_and_ping() {
    let (_broker, addr) = default_broker().await;
    let mut client = TestClient::connect(addr).await;

    let connack = client.mqtt_connect("pinger").await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert!(!connack.session_present);

    client.send(&Packet::new(PacketType::PingReq, 0)).await;
    client.expect(PacketType::PingResp).await;
}

#[tokio::test]
async fn test_disconnect_closes_connection() {
    let (broker, addr) = default_broker().await;
    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("leaver").await;

    client.send(&Packet::new(PacketType::Disconnect, 0)).await;
    assert!(client.closed().await);

    let stats = wait_for_stats(&broker, |s| s.sessions == 0).await;
    assert_eq!(stats.sessions, 0);
}

#[tokio::test]
async fn test_unsupported_protocol_level() {
    let (_broker, addr) = default_broker().await;
    let mut client = TestClient::connect(addr).await;

    client
        .send(&Connect::default().encode(5).unwrap())
        .await;
    let mut packet = client.expect(PacketType::ConnAck).await;
    assert_eq!(
        ConnAck::decode(&mut packet).unwrap().return_code,
        ConnectReturnCode::UnacceptableProtocolVersion
    );
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_first_packet_must_be_connect() {
    let (_broker, addr) = default_broker().await;
    let mut client = TestClient::connect(addr).await;

    client.send(&Packet::new(PacketType::PingReq, 0)).await;
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_invalid_packet_type_closes() {
    let (_broker, addr) = default_broker().await;
    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("bad-type").await;

    client.send_raw(&[0xF0, 0x00]).await;
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_oversized_packet_closes() {
    let config = BrokerConfig {
        max_packet_size: 64,
        ..Default::default()
    };
    let (_broker, addr) = start_broker(config).await;
    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("big").await;

    client
        .publish("t", QoS::AtMostOnce, None, &[0u8; 128])
        .await;
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_connection_limit() {
    let config = BrokerConfig {
        max_connections: 1,
        ..Default::default()
    };
    let (_broker, addr) = start_broker(config).await;

    let mut first = TestClient::connect(addr).await;
    first.mqtt_connect("first").await;

    let mut second = TestClient::connect(addr).await;
    assert!(second.closed().await);
}

// ============================================================================
// Publish / subscribe
// ============================================================================

#[tokio::test]
async fn test_qos0_fan_out_with_wildcard() {
    let (_broker, addr) = default_broker().await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub").await;
    let suback = sub.subscribe(1, "sensors/+/temp", QoS::AtLeastOnce).await;
    assert_eq!(suback.return_codes, vec![1]);

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub").await;
    publisher
        .publish("sensors/room1/temp", QoS::AtMostOnce, None, b"21.5")
        .await;

    let publish = sub.expect_publish().await;
    assert_eq!(publish.topic, "sensors/room1/temp");
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(&publish.content[..], b"21.5");
}

#[tokio::test]
async fn test_qos1_end_to_end() {
    let (broker, addr) = default_broker().await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub").await;
    sub.subscribe(1, "a/#", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub").await;
    publisher
        .publish("a/b", QoS::AtLeastOnce, Some(11), b"hello")
        .await;
    assert_eq!(
        publisher.expect_ack(PacketType::PubAck).await,
        PacketIdAck::puback(11)
    );

    let publish = sub.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    let id = publish.packet_id.unwrap();
    sub.ack(PacketIdAck::puback(id)).await;

    let stats = wait_for_stats(&broker, |s| s.messages == 0).await;
    assert_eq!(stats.messages, 0);
    assert_eq!(stats.queued_deliveries, 0);
}

#[tokio::test]
async fn test_qos2_end_to_end() {
    let (broker, addr) = default_broker().await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub").await;
    sub.subscribe(1, "q", QoS::ExactlyOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub").await;
    publisher
        .publish("q", QoS::ExactlyOnce, Some(7), b"once")
        .await;
    assert_eq!(
        publisher.expect_ack(PacketType::PubRec).await,
        PacketIdAck::pubrec(7)
    );

    publisher.ack(PacketIdAck::pubrel(7)).await;
    assert_eq!(
        publisher.expect_ack(PacketType::PubComp).await,
        PacketIdAck::pubcomp(7)
    );

    let publish = sub.expect_publish().await;
    assert_eq!(publish.qos, QoS::ExactlyOnce);
    let id = publish.packet_id.unwrap();

    sub.ack(PacketIdAck::pubrec(id)).await;
    let pubrel = sub.expect(PacketType::PubRel).await;
    assert_eq!(pubrel.flags(), 0x02);

    sub.ack(PacketIdAck::pubcomp(id)).await;
    let stats = wait_for_stats(&broker, |s| s.messages == 0).await;
    assert_eq!(stats.messages, 0);
}

#[tokio::test]
async fn test_delivery_qos_is_downgraded() {
    let (_broker, addr) = default_broker().await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub").await;
    sub.subscribe(1, "t", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub").await;
    publisher.publish("t", QoS::AtLeastOnce, Some(1), b"x").await;
    publisher.expect(PacketType::PubAck).await;

    let publish = sub.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, None);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (_broker, addr) = default_broker().await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub").await;
    sub.subscribe(1, "x/+", QoS::AtMostOnce).await;
    sub.subscribe(2, "y", QoS::AtMostOnce).await;

    sub.send(
        &Unsubscribe {
            packet_id: 3,
            filters: vec!["x/+".to_string()],
        }
        .encode()
        .unwrap(),
    )
    .await;
    assert_eq!(
        sub.expect_ack(PacketType::UnsubAck).await,
        PacketIdAck::unsuback(3)
    );

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub").await;
    publisher.publish("x/1", QoS::AtMostOnce, None, b"dropped").await;
    publisher.publish("y", QoS::AtMostOnce, None, b"kept").await;

    // Only the message on the remaining filter arrives
    let publish = sub.expect_publish().await;
    assert_eq!(publish.topic, "y");
}

#[tokio::test]
async fn test_disconnect_releases_undelivered_messages() {
    let (broker, addr) = default_broker().await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub").await;
    sub.subscribe(1, "t", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub").await;
    for id in 1..=3 {
        publisher.publish("t", QoS::AtLeastOnce, Some(id), b"x").await;
        publisher.expect(PacketType::PubAck).await;
    }

    // Never acknowledged: three deliveries stay in flight
    for _ in 0..3 {
        sub.expect_publish().await;
    }
    let stats = wait_for_stats(&broker, |s| s.messages == 3).await;
    assert_eq!(stats.queued_deliveries, 3);

    drop(sub);
    let stats = wait_for_stats(&broker, |s| s.sessions == 1).await;
    assert_eq!(
        stats,
        EngineStats {
            sessions: 1,
            filters: 0,
            messages: 0,
            queued_deliveries: 0,
        }
    );
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let (broker, addr) = default_broker().await;
    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c").await;

    broker.shutdown();
    assert!(client.closed().await);
}
