//! MQTT Connection Handler
//!
//! One task per client connection. A reader task pulls complete packets off
//! the socket and hands them over a channel; the connection loop dispatches
//! each one to the engine ([`Connection::on_readable`]) and drains the
//! session's outbound queue whenever it is woken ([`Connection::on_writable`]).
//! Only this task ever writes to the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::Wakers;
use crate::codec::{read_packet, Packet, ReadError};
use crate::engine::{Engine, EngineError};
use crate::protocol::EncodeError;
use crate::session::ConnectionId;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Read(ReadError),
    Engine(EngineError),
    Encode(EncodeError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Read(e) => write!(f, "Read error: {}", e),
            ConnectionError::Engine(e) => write!(f, "Engine error: {}", e),
            ConnectionError::Encode(e) => write!(f, "Encode error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<ReadError> for ConnectionError {
    fn from(e: ReadError) -> Self {
        ConnectionError::Read(e)
    }
}

impl From<EngineError> for ConnectionError {
    fn from(e: EngineError) -> Self {
        ConnectionError::Engine(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Encode(e)
    }
}

/// What the connection loop does after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close,
}

type ReadResult = Result<Option<Packet>, ReadError>;

/// Read packets until EOF or the first error, forwarding every outcome
async fn read_loop<R>(mut reader: R, max_packet_size: usize, tx: mpsc::Sender<ReadResult>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let result = read_packet(&mut reader, max_packet_size).await;
        let done = !matches!(result, Ok(Some(_)));
        if tx.send(result).await.is_err() || done {
            break;
        }
    }
}

/// A client connection
pub struct Connection<S> {
    id: ConnectionId,
    addr: SocketAddr,
    writer: WriteHalf<S>,
    write_buf: BytesMut,
    packets: mpsc::Receiver<ReadResult>,
    reader_task: JoinHandle<()>,
    engine: Arc<Mutex<Engine>>,
    wakers: Wakers,
    notify: Arc<Notify>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Register the session and start reading. Must be called inside a
    /// tokio runtime.
    pub fn new(
        stream: S,
        id: ConnectionId,
        addr: SocketAddr,
        engine: Arc<Mutex<Engine>>,
        wakers: Wakers,
        max_packet_size: usize,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, packets) = mpsc::channel(1);
        let reader_task = tokio::spawn(read_loop(reader, max_packet_size, tx));

        engine
            .lock()
            .add_session(id, Some(addr.ip()), Some(addr.port()));
        let notify = Arc::new(Notify::new());
        wakers.insert(id, notify.clone());

        Self {
            id,
            addr,
            writer,
            write_buf: BytesMut::with_capacity(1024),
            packets,
            reader_task,
            engine,
            wakers,
            notify,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Serve the connection until close, error or shutdown, then tear the
    /// session down.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        let result = self.event_loop(&mut shutdown).await;
        self.teardown();
        let _ = self.writer.shutdown().await;
        result
    }

    async fn event_loop(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        loop {
            let disposition = tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    debug!("{} shutting down", self.id);
                    Disposition::Close
                }
                read = self.packets.recv() => match read {
                    Some(Ok(Some(packet))) => self.on_readable(packet).await?,
                    Some(Ok(None)) | None => {
                        debug!("Connection closed from {}", self.addr);
                        Disposition::Close
                    }
                    Some(Err(e)) => return Err(e.into()),
                },
                _ = self.notify.notified() => self.on_writable().await?,
            };

            if disposition == Disposition::Close {
                return Ok(());
            }
        }
    }

    /// Dispatch one inbound packet: write the reply, wake every session that
    /// gained deliveries, then drain this session's own queue.
    pub async fn on_readable(&mut self, packet: Packet) -> Result<Disposition, ConnectionError> {
        let dispatch = self.engine.lock().handle_packet(self.id, packet)?;

        if let Some(reply) = dispatch.reply {
            self.send(std::slice::from_ref(&reply)).await?;
        }

        for conn in dispatch.wake.iter().filter(|c| **c != self.id) {
            if let Some(waker) = self.wakers.get(conn) {
                waker.notify_one();
            }
        }

        if dispatch.close {
            return Ok(Disposition::Close);
        }
        self.on_writable().await
    }

    /// Drain one pass of the outbound queue onto the socket
    pub async fn on_writable(&mut self) -> Result<Disposition, ConnectionError> {
        let packets = self.engine.lock().drain(self.id)?;
        if !packets.is_empty() {
            trace!("{} writing {} packets", self.id, packets.len());
            self.send(&packets).await?;
        }
        Ok(Disposition::Continue)
    }

    async fn send(&mut self, packets: &[Packet]) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        for packet in packets {
            packet.encode(&mut self.write_buf)?;
        }
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Runs exactly once, from `run`
    fn teardown(&mut self) {
        self.reader_task.abort();
        self.wakers.remove(&self.id);
        match self.engine.lock().remove_session(self.id) {
            Ok(Some(teardown)) => debug!(
                "{} torn down, {} deliveries released",
                self.id, teardown.released
            ),
            Ok(None) => {}
            Err(e) => error!("Teardown of {} failed: {}", self.id, e),
        }
    }
}
