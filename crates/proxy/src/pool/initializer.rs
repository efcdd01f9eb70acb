//! Outbound pipeline construction.
//!
//! Every origin channel gets the same handler chain, in a fixed order:
//! trace logging, the idle-timeout stage (installed under its well-known
//! name so acquire can reinstall it), the optional method-binding wrapper,
//! and the pool stage that returns or retires the connection when its
//! request/response cycle ends.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use gatehouse_common::GatehouseError;

use crate::channel::Channel;
use crate::config::ConnectionPoolConfig;
use crate::pipeline::{
    ChannelHandler, CompleteReason, HandlerContext, LifecycleEvent, MethodBinding,
    MethodBindingHandler, Pipeline, PipelineBuilder, PipelineMessage,
};
use crate::pool::connection::OriginConnection;
use crate::pool::PerServerConnectionPool;
use crate::timeout::{IdleTimeoutHandler, IDLE_STAGE};

pub const ORIGIN_TRACE_STAGE: &str = "origin-trace";
pub const METHOD_BINDING_STAGE: &str = "method-binding";
pub const POOL_STAGE: &str = "pool";

/// Late-bound link from an origin channel's pool stage to the pool and
/// connection that own it. The pipeline is built before the connection
/// object exists, so the pool fills this in at wrap time.
#[derive(Default)]
pub struct PoolAttachment {
    inner: Mutex<Option<(Weak<PerServerConnectionPool>, OriginConnection)>>,
}

impl PoolAttachment {
    pub(crate) fn bind(&self, pool: Weak<PerServerConnectionPool>, conn: OriginConnection) {
        *self.inner.lock() = Some((pool, conn));
    }

    fn get(&self) -> Option<(Arc<PerServerConnectionPool>, OriginConnection)> {
        let inner = self.inner.lock();
        inner
            .as_ref()
            .and_then(|(pool, conn)| pool.upgrade().map(|p| (p, conn.clone())))
    }
}

/// Deterministic construction of the per-origin-channel handler chain.
pub struct OutboundPipelineInitializer {
    config: Arc<ConnectionPoolConfig>,
    binding: Option<Arc<dyn MethodBinding>>,
}

impl OutboundPipelineInitializer {
    pub fn new(config: Arc<ConnectionPoolConfig>) -> Self {
        Self {
            config,
            binding: None,
        }
    }

    /// Install a method-binding wrapper around downstream dispatch.
    pub fn with_method_binding(mut self, binding: Arc<dyn MethodBinding>) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn init(&self, channel: Channel) -> (Pipeline, Arc<PoolAttachment>) {
        let attachment = Arc::new(PoolAttachment::default());

        let mut builder = PipelineBuilder::new()
            .add(
                ORIGIN_TRACE_STAGE,
                Arc::new(OriginTraceHandler {
                    origin: self.config.origin_name.clone(),
                }),
            )
            .add(IDLE_STAGE, IdleTimeoutHandler::inert());
        if let Some(binding) = &self.binding {
            builder = builder.add(
                METHOD_BINDING_STAGE,
                Arc::new(MethodBindingHandler::new(Arc::clone(binding))),
            );
        }
        let pipeline = builder
            .add(
                POOL_STAGE,
                Arc::new(OriginPoolHandler {
                    origin: self.config.origin_name.clone(),
                    attachment: Arc::clone(&attachment),
                }),
            )
            .build(channel);

        IdleTimeoutHandler::install(&pipeline, self.config.idle_timeout());
        (pipeline, attachment)
    }
}

/// Trace-level visibility into origin channel traffic.
struct OriginTraceHandler {
    origin: String,
}

impl ChannelHandler for OriginTraceHandler {
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) {
        trace!(origin = %self.origin, channel = %ctx.channel().id(), kind = msg.kind(), "origin read");
        ctx.forward_read(msg);
    }

    fn on_write(
        &self,
        ctx: &HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> gatehouse_common::GatehouseResult<()> {
        trace!(origin = %self.origin, channel = %ctx.channel().id(), kind = msg.kind(), "origin write");
        ctx.write(msg)
    }
}

/// Terminal origin-channel stage tying the channel back to its pool.
///
/// A completed cycle releases the connection for reuse; any other ending
/// (idle timeout, disconnect, error) retires it.
struct OriginPoolHandler {
    origin: String,
    attachment: Arc<PoolAttachment>,
}

impl OriginPoolHandler {
    fn retire(&self, reason: &str) {
        if let Some((pool, conn)) = self.attachment.get() {
            debug!(origin = %self.origin, conn = ?conn, reason, "retiring origin connection");
            conn.finish_request();
            if conn.in_pool() {
                pool.remove(&conn);
            } else {
                pool.note_in_use_closed(&conn);
            }
            conn.close();
        }
    }
}

impl ChannelHandler for OriginPoolHandler {
    fn on_event(&self, ctx: &HandlerContext<'_>, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Complete(CompleteReason::SessionComplete) => {
                if let Some((pool, conn)) = self.attachment.get() {
                    conn.finish_request();
                    pool.release(conn);
                }
            }
            LifecycleEvent::Complete(reason) => {
                self.retire(match reason {
                    CompleteReason::Inactive => "inactive",
                    CompleteReason::Idle => "idle",
                    CompleteReason::PipelineReject => "pipeline reject",
                    CompleteReason::Disconnect => "disconnect",
                    CompleteReason::SessionComplete => unreachable!(),
                });
            }
            LifecycleEvent::IdleState => {
                debug!(origin = %self.origin, channel = %ctx.channel().id(), "origin channel idle timeout");
                self.retire("idle timeout");
            }
            LifecycleEvent::Start => {}
        }
        ctx.forward_event(event);
    }

    fn on_error(&self, ctx: &HandlerContext<'_>, error: GatehouseError) {
        warn!(
            origin = %self.origin,
            channel = %ctx.channel().info(),
            error = %error,
            "error on origin channel"
        );
        self.retire("error");
        ctx.forward_error(error);
    }
}
