//! Gatehouse proxy core.
//!
//! The edge of an HTTP gateway: terminates inbound client connections,
//! materializes each transaction as an in-memory request flowing through
//! a filter pipeline, and reuses persistent origin connections through a
//! per-origin, per-event-loop pool.
//!
//! This crate provides:
//!
//! - **Inbound lifecycle**: [`ClientRequestReceiver`] and
//!   [`ClientResponseWriter`], the stage pair carrying one request/response
//!   cycle per channel
//! - **Outbound pooling**: [`PerServerConnectionPool`] with lock-free-hot-path
//!   bookkeeping partitioned by event loop
//! - **Pipeline**: an explicit ordered handler chain per channel
//! - **Diagnostics**: per-channel passport traces and per-origin stats
//!
//! The socket engine, HTTP codec, filter runtime, service discovery, and
//! TLS handshake all live outside this crate, behind the seams in
//! [`channel`], [`codec`], and [`pipeline`].

pub mod channel;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod headers;
pub mod passport;
pub mod pipeline;
pub mod pool;
pub mod receiver;
pub mod request;
pub mod response;
pub mod session;
pub mod stats;
pub mod timeout;
pub mod writer;

// Channel surface
pub use channel::{attrs, AttrKey, AttrTable, Channel, ChannelId, EventLoopId, Transport};

// Codec boundary
pub use codec::{BodyChunk, FrameEncoder, HttpFrame, ProxyInfo, RequestHead, ResponseHead};

// Pipeline
pub use pipeline::{
    ChannelHandler, CompleteReason, HandlerContext, LifecycleEvent, MethodBinding, Pipeline,
    PipelineBuilder, PipelineMessage,
};

// Messages
pub use request::{RequestInfo, RequestMessage};
pub use response::ResponseMessage;
pub use session::{SessionContext, SessionDecorator};

// Inbound handlers
pub use receiver::ClientRequestReceiver;
pub use writer::{ClientResponseWriter, RequestCompleteHandler};

// Outbound pooling
pub use config::ConnectionPoolConfig;
pub use discovery::Server;
pub use pool::{
    ConnState, ConnectionFactory, Connector, OriginChannel, OriginConnection,
    OutboundPipelineInitializer, PerServerConnectionPool, TcpConnector,
};
pub use stats::{PoolCounters, ServerStats};

// Diagnostics
pub use passport::{Passport, PassportState};
pub use timeout::IdleTimeoutHandler;

// Re-export common error types for convenience
pub use gatehouse_common::{GatehouseError, GatehouseResult, OutboundErrorKind, WriteStage};
