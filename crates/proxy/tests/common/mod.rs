//! Shared test utilities for integration tests
//!
//! In-memory transports, a scripted connector, and inbound pipeline
//! fixtures used across the integration test files.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use gatehouse_common::GatehouseResult;
use gatehouse_proxy::channel::{Channel, EventLoopId, Transport};
use gatehouse_proxy::codec::{BodyChunk, HttpFrame, RequestHead, ResponseHead};
use gatehouse_proxy::headers::Headers;
use gatehouse_proxy::pipeline::{
    ChannelHandler, HandlerContext, Pipeline, PipelineBuilder, PipelineMessage,
};
use gatehouse_proxy::pool::{ConnectionFactory, Connector, PerServerConnectionPool};
use gatehouse_proxy::receiver::ClientRequestReceiver;
use gatehouse_proxy::request::RequestMessage;
use gatehouse_proxy::stats::{PoolCounters, ServerStats};
use gatehouse_proxy::writer::ClientResponseWriter;
use gatehouse_proxy::{ConnectionPoolConfig, OutboundPipelineInitializer, Server};

#[derive(Debug)]
pub struct TestIo {
    event_loop: EventLoopId,
    open: AtomicBool,
    active: AtomicBool,
    close_count: AtomicU32,
    flush_count: AtomicU32,
    read_requests: AtomicU32,
    frames: Mutex<Vec<HttpFrame>>,
}

/// In-memory [`Transport`] recording everything the proxy core does to it.
#[derive(Clone, Debug)]
pub struct TestTransport(pub Arc<TestIo>);

impl TestTransport {
    pub fn new(event_loop: EventLoopId) -> Self {
        Self(Arc::new(TestIo {
            event_loop,
            open: AtomicBool::new(true),
            active: AtomicBool::new(true),
            close_count: AtomicU32::new(0),
            flush_count: AtomicU32::new(0),
            read_requests: AtomicU32::new(0),
            frames: Mutex::new(Vec::new()),
        }))
    }

    pub fn written_frames(&self) -> Vec<HttpFrame> {
        self.0.frames.lock().clone()
    }

    pub fn clear_frames(&self) {
        self.0.frames.lock().clear();
    }

    pub fn set_open(&self, open: bool) {
        self.0.open.store(open, Ordering::Release);
    }

    pub fn set_active(&self, active: bool) {
        self.0.active.store(active, Ordering::Release);
    }

    pub fn close_count(&self) -> u32 {
        self.0.close_count.load(Ordering::Acquire)
    }

    pub fn flush_count(&self) -> u32 {
        self.0.flush_count.load(Ordering::Acquire)
    }

    pub fn read_requests(&self) -> u32 {
        self.0.read_requests.load(Ordering::Acquire)
    }
}

impl Transport for TestTransport {
    fn event_loop(&self) -> EventLoopId {
        self.0.event_loop
    }

    fn is_open(&self) -> bool {
        self.0.open.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.0.active.load(Ordering::Acquire)
    }

    fn write(&self, frame: HttpFrame) -> GatehouseResult<()> {
        if !self.is_open() {
            return Err(gatehouse_common::GatehouseError::internal(
                "write on closed channel",
            ));
        }
        self.0.frames.lock().push(frame);
        Ok(())
    }

    fn flush(&self) {
        self.0.flush_count.fetch_add(1, Ordering::AcqRel);
    }

    fn request_read(&self) {
        self.0.read_requests.fetch_add(1, Ordering::AcqRel);
    }

    fn close(&self) {
        self.0.open.store(false, Ordering::Release);
        self.0.active.store(false, Ordering::Release);
        self.0.close_count.fetch_add(1, Ordering::AcqRel);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some("127.0.0.1:8080".parse().unwrap())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some("192.0.2.10:45678".parse().unwrap())
    }
}

/// Scripted connector: yields fresh [`TestTransport`]s unless a failure
/// was queued.
#[derive(Default)]
pub struct TestConnector {
    failures: Mutex<VecDeque<io::Error>>,
    created: Mutex<Vec<TestTransport>>,
}

impl TestConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: io::Error) {
        self.failures.lock().push_back(error);
    }

    pub fn created(&self) -> Vec<TestTransport> {
        self.created.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(
        &self,
        _host: &str,
        _port: u16,
        event_loop: EventLoopId,
    ) -> io::Result<Box<dyn Transport>> {
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        let transport = TestTransport::new(event_loop);
        self.created.lock().push(transport.clone());
        Ok(Box::new(transport))
    }
}

pub struct PoolFixture {
    pub pool: Arc<PerServerConnectionPool>,
    pub connector: Arc<TestConnector>,
    pub stats: Arc<ServerStats>,
    pub counters: Arc<PoolCounters>,
}

pub fn pool_fixture(config: ConnectionPoolConfig) -> PoolFixture {
    let connector = Arc::new(TestConnector::new());
    let config = Arc::new(config);
    let stats = Arc::new(ServerStats::new());
    let counters = Arc::new(PoolCounters::new());
    let factory = Arc::new(ConnectionFactory::new(
        Arc::clone(&connector) as Arc<dyn Connector>,
        OutboundPipelineInitializer::new(Arc::clone(&config)),
    ));
    let pool = PerServerConnectionPool::new(
        Server::static_endpoint("origin-a.internal", 8080),
        Arc::clone(&stats),
        factory,
        config,
        Arc::clone(&counters),
    );
    PoolFixture {
        pool,
        connector,
        stats,
        counters,
    }
}

pub type Responder = Box<dyn Fn(&HandlerContext<'_>, &Arc<RequestMessage>) + Send + Sync>;

/// Stand-in for the external filter runtime: records what it receives and
/// optionally produces a response for each request.
#[derive(Default)]
pub struct FilterProbe {
    pub requests: Mutex<Vec<Arc<RequestMessage>>>,
    pub chunks: Mutex<Vec<BodyChunk>>,
    pub responder: Mutex<Option<Responder>>,
}

impl FilterProbe {
    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = Some(responder);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn last_request(&self) -> Arc<RequestMessage> {
        self.requests
            .lock()
            .last()
            .cloned()
            .expect("no request seen by the filter probe")
    }
}

impl ChannelHandler for FilterProbe {
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) {
        match msg {
            PipelineMessage::Request(request) => {
                self.requests.lock().push(Arc::clone(&request));
                if let Some(responder) = self.responder.lock().as_ref() {
                    responder(ctx, &request);
                }
            }
            PipelineMessage::Frame(HttpFrame::Content(chunk)) => {
                self.chunks.lock().push(chunk);
            }
            other => ctx.forward_read(other),
        }
    }
}

pub struct InboundFixture {
    pub transport: TestTransport,
    pub pipeline: Pipeline,
    pub filters: Arc<FilterProbe>,
}

/// Client-channel pipeline in gateway order: receiver, filter runtime
/// stand-in, response writer.
pub fn inbound_fixture() -> InboundFixture {
    let transport = TestTransport::new(EventLoopId(1));
    let channel = Channel::new(Box::new(transport.clone()));
    let filters = Arc::new(FilterProbe::default());
    let pipeline = PipelineBuilder::new()
        .add("receiver", Arc::new(ClientRequestReceiver::new()))
        .add("filters", Arc::clone(&filters) as Arc<dyn ChannelHandler>)
        .add("writer", Arc::new(ClientResponseWriter::new()))
        .build(channel);
    InboundFixture {
        transport,
        pipeline,
        filters,
    }
}

/// Decoded request head with defaults suitable for tests.
pub fn request_head(method: &str, uri: &str, version: &str) -> RequestHead {
    RequestHead {
        version: version.to_string(),
        method: method.to_string(),
        uri: uri.to_string(),
        headers: Headers::new(),
        decode_error: None,
        aggregated_body: None,
    }
}

/// The response heads written to the transport, in order.
pub fn written_response_heads(transport: &TestTransport) -> Vec<ResponseHead> {
    transport
        .written_frames()
        .into_iter()
        .filter_map(|frame| match frame {
            HttpFrame::ResponseHead(head) => Some(head),
            _ => None,
        })
        .collect()
}

/// The body chunks written to the transport, in order.
pub fn written_chunks(transport: &TestTransport) -> Vec<BodyChunk> {
    transport
        .written_frames()
        .into_iter()
        .filter_map(|frame| match frame {
            HttpFrame::Content(chunk) => Some(chunk),
            _ => None,
        })
        .collect()
}
