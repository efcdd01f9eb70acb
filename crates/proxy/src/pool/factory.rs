//! Origin connection establishment.
//!
//! The [`ConnectionFactory`] turns a [`Server`] into a fresh [`Channel`]
//! with the outbound pipeline installed. The actual transport comes from a
//! [`Connector`]; [`TcpConnector`] is the stock implementation over
//! `tokio::net::TcpStream`, with outbound frames serialized through the
//! host-installed [`FrameEncoder`]. Hosts integrating a full codec driver
//! supply their own connector.

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tracing::trace;

use gatehouse_common::{GatehouseError, GatehouseResult};

use crate::channel::{Channel, EventLoopId, Transport};
use crate::codec::{FrameEncoder, HttpFrame};
use crate::discovery::Server;
use crate::pipeline::Pipeline;
use crate::pool::initializer::{OutboundPipelineInitializer, PoolAttachment};

/// Dials an origin endpoint and yields a transport bound to the caller's
/// event loop.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        event_loop: EventLoopId,
    ) -> io::Result<Box<dyn Transport>>;
}

enum WriterOp {
    Frame(HttpFrame),
    Flush,
}

/// Transport over a plain TCP stream.
///
/// Writes are encoded by the installed [`FrameEncoder`] on a writer task;
/// reads follow explicit read interest (`request_read` grants one read)
/// so the peer cannot flood a channel nobody is reading. Decoding inbound
/// bytes is the external codec driver's job; without one the reader only
/// watches for the peer closing.
pub struct StreamTransport {
    event_loop: EventLoopId,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    open: Arc<AtomicBool>,
    writer: Mutex<Option<mpsc::UnboundedSender<WriterOp>>>,
    read_credits: Arc<Semaphore>,
}

impl StreamTransport {
    pub fn spawn(
        stream: TcpStream,
        event_loop: EventLoopId,
        encoder: Arc<dyn FrameEncoder>,
    ) -> Self {
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        let open = Arc::new(AtomicBool::new(true));
        let read_credits = Arc::new(Semaphore::new(0));
        let (tx, rx) = mpsc::unbounded_channel();

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(writer_task(rx, write_half, encoder, Arc::clone(&open)));
        tokio::spawn(reader_task(
            read_half,
            Arc::clone(&read_credits),
            Arc::clone(&open),
        ));

        Self {
            event_loop,
            local,
            peer,
            open,
            writer: Mutex::new(Some(tx)),
            read_credits,
        }
    }
}

async fn writer_task(
    mut rx: mpsc::UnboundedReceiver<WriterOp>,
    mut write_half: OwnedWriteHalf,
    encoder: Arc<dyn FrameEncoder>,
    open: Arc<AtomicBool>,
) {
    let mut pending = BytesMut::new();
    while let Some(op) = rx.recv().await {
        match op {
            WriterOp::Frame(frame) => {
                if encoder.encode(&frame, &mut pending).is_err() {
                    break;
                }
            }
            WriterOp::Flush => {
                if write_half.write_all(&pending).await.is_err() {
                    break;
                }
                pending.clear();
                if write_half.flush().await.is_err() {
                    break;
                }
            }
        }
    }
    open.store(false, Ordering::Release);
    let _ = write_half.shutdown().await;
}

async fn reader_task(
    mut read_half: OwnedReadHalf,
    credits: Arc<Semaphore>,
    open: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 8192];
    loop {
        let Ok(permit) = credits.acquire().await else {
            return;
        };
        permit.forget();
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                open.store(false, Ordering::Release);
                return;
            }
            Ok(n) => {
                trace!(bytes = n, "inbound bytes with no codec driver installed");
            }
        }
    }
}

impl Transport for StreamTransport {
    fn event_loop(&self) -> EventLoopId {
        self.event_loop
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.is_open()
    }

    fn write(&self, frame: HttpFrame) -> GatehouseResult<()> {
        if !self.is_open() {
            return Err(GatehouseError::internal("write on closed channel"));
        }
        let sender = self.writer.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(GatehouseError::internal("write on closed channel"));
        };
        tx.send(WriterOp::Frame(frame))
            .map_err(|_| GatehouseError::internal("write on closed channel"))
    }

    fn flush(&self) {
        if let Some(tx) = self.writer.lock().as_ref() {
            let _ = tx.send(WriterOp::Flush);
        }
    }

    fn request_read(&self) {
        self.read_credits.add_permits(1);
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        // Dropping the sender ends the writer task, which shuts the stream down.
        self.writer.lock().take();
        self.read_credits.close();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Stock connector dialing origins over plain TCP.
pub struct TcpConnector {
    encoder: Arc<dyn FrameEncoder>,
}

impl TcpConnector {
    pub fn new(encoder: Arc<dyn FrameEncoder>) -> Self {
        Self { encoder }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        event_loop: EventLoopId,
    ) -> io::Result<Box<dyn Transport>> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(StreamTransport::spawn(
            stream,
            event_loop,
            Arc::clone(&self.encoder),
        )))
    }
}

/// A freshly connected origin channel with its pipeline installed.
pub struct OriginChannel {
    pub channel: Channel,
    pub pipeline: Pipeline,
    pub pool_slot: Arc<PoolAttachment>,
}

/// Creates origin channels: dials through the connector, then installs
/// the outbound handler chain.
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    initializer: OutboundPipelineInitializer,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn Connector>, initializer: OutboundPipelineInitializer) -> Self {
        Self {
            connector,
            initializer,
        }
    }

    pub async fn connect(
        &self,
        server: &Server,
        event_loop: EventLoopId,
    ) -> io::Result<OriginChannel> {
        let transport = self
            .connector
            .connect(server.host(), server.port(), event_loop)
            .await?;
        let channel = Channel::new(transport);
        let (pipeline, pool_slot) = self.initializer.init(channel.clone());
        Ok(OriginChannel {
            channel,
            pipeline,
            pool_slot,
        })
    }
}
