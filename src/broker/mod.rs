//! MQTT Broker Core
//!
//! The TCP transport around the [`Engine`]: accepts connections, assigns
//! each one a fresh [`ConnectionId`], and runs one task per connection.
//!
//! All connections share one engine behind a mutex. The lock is taken for
//! exactly one packet dispatch or one drain pass, and packets are read in
//! full before it is taken, so a partially received packet never holds up
//! or interleaves with another connection's work.

mod connection;

pub use connection::{Connection, ConnectionError, Disposition};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineConfig};
use crate::session::ConnectionId;

/// Default cap on inbound remaining length (1 MB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum inbound remaining length
    pub max_packet_size: usize,
    /// Protocol options
    pub engine: EngineConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 1000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            engine: EngineConfig::default(),
        }
    }
}

/// Per-connection wake-up handles, used to tell a connection task that its
/// session gained deliveries
pub type Wakers = Arc<DashMap<ConnectionId, Arc<Notify>>>;

/// The MQTT Broker
pub struct Broker {
    config: BrokerConfig,
    engine: Arc<Mutex<Engine>>,
    wakers: Wakers,
    next_conn: AtomicU64,
    active: Arc<AtomicUsize>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            engine: Arc::new(Mutex::new(Engine::new(config.engine.clone()))),
            config,
            wakers: Arc::new(DashMap::new()),
            next_conn: AtomicU64::new(1),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Shared engine handle
    pub fn engine(&self) -> Arc<Mutex<Engine>> {
        self.engine.clone()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let mut shutdown_rx = self.shutdown.subscribe();

        debug!("Starting TCP accept loop");
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.handle_connection(stream, addr),
                    Err(e) => error!("Failed to accept TCP connection: {}", e),
                },
                _ = shutdown_rx.recv() => {
                    info!("Accept loop stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Handle a new connection
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if self.active.load(Ordering::Acquire) >= self.config.max_connections {
            warn!(
                "Connection limit {} reached, refusing {}",
                self.config.max_connections, addr
            );
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let id = ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        debug!("New TCP connection from {} as {}", addr, id);

        self.active.fetch_add(1, Ordering::AcqRel);
        let active = self.active.clone();
        let conn = Connection::new(
            stream,
            id,
            addr,
            self.engine.clone(),
            self.wakers.clone(),
            self.config.max_packet_size,
        );
        let shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            if let Err(e) = conn.run(shutdown_rx).await {
                debug!("Connection error from {}: {}", addr, e);
            }
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}
