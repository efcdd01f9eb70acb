//! Ordered handler chain for one channel.
//!
//! The pipeline replaces an inheritance tree of channel handlers with an
//! explicit ordered list of named stages. Inbound messages, lifecycle
//! events, and errors traverse head to tail; writes initiated by a stage
//! traverse the stages before it and end at the transport.
//!
//! Dispatch works on a snapshot of the stage list, so a stage may be
//! replaced (by name) between messages without affecting a traversal in
//! progress. All callbacks for a channel run serially on its event loop;
//! handlers keep per-connection state behind short-lived locks, never
//! blocking.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{trace, warn};

use gatehouse_common::{GatehouseError, GatehouseResult};

use crate::channel::Channel;
use crate::codec::HttpFrame;
use crate::request::RequestMessage;
use crate::response::ResponseMessage;

/// A message traversing the pipeline: a wire frame, or one of the
/// materialized gateway messages exchanged with the filter runtime.
#[derive(Debug, Clone)]
pub enum PipelineMessage {
    Frame(HttpFrame),
    Request(Arc<RequestMessage>),
    Response(Arc<ResponseMessage>),
}

impl PipelineMessage {
    /// Short type tag for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Frame(frame) => frame.kind(),
            Self::Request(_) => "request message",
            Self::Response(_) => "response message",
        }
    }
}

/// Why a request/response cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteReason {
    SessionComplete,
    Inactive,
    Idle,
    PipelineReject,
    Disconnect,
}

/// Synthetic lifecycle signals emitted on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    Complete(CompleteReason),
    IdleState,
}

/// One stage of a channel pipeline.
///
/// Every callback has a forwarding default, so a stage only implements
/// what it cares about. Callbacks must not block the event loop.
pub trait ChannelHandler: Send + Sync {
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) {
        ctx.forward_read(msg);
    }

    fn on_write(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) -> GatehouseResult<()> {
        ctx.write(msg)
    }

    fn on_event(&self, ctx: &HandlerContext<'_>, event: LifecycleEvent) {
        ctx.forward_event(event);
    }

    fn on_error(&self, ctx: &HandlerContext<'_>, error: GatehouseError) {
        ctx.forward_error(error);
    }
}

#[derive(Clone)]
struct Stage {
    name: &'static str,
    handler: Arc<dyn ChannelHandler>,
}

/// A stage's view of the pipeline during one dispatch.
pub struct HandlerContext<'a> {
    channel: &'a Channel,
    stages: &'a [Stage],
    index: usize,
}

impl HandlerContext<'_> {
    pub fn channel(&self) -> &Channel {
        self.channel
    }

    /// Pass an inbound message to the next stage toward the tail.
    pub fn forward_read(&self, msg: PipelineMessage) {
        dispatch_read(self.channel, self.stages, self.index + 1, msg);
    }

    /// Pass a lifecycle event to the next stage toward the tail.
    pub fn forward_event(&self, event: LifecycleEvent) {
        dispatch_event(self.channel, self.stages, self.index + 1, event);
    }

    /// Pass an error to the next stage toward the tail.
    pub fn forward_error(&self, error: GatehouseError) {
        dispatch_error(self.channel, self.stages, self.index + 1, error);
    }

    /// Write an outbound message through the stages before this one and
    /// on to the transport.
    pub fn write(&self, msg: PipelineMessage) -> GatehouseResult<()> {
        dispatch_write(self.channel, self.stages, self.index, msg)
    }

    pub fn write_and_flush(&self, msg: PipelineMessage) -> GatehouseResult<()> {
        let result = self.write(msg);
        self.channel.flush();
        result
    }

    pub fn flush(&self) {
        self.channel.flush();
    }

    /// Ask the engine for the next inbound message.
    pub fn read(&self) {
        self.channel.request_read();
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

fn dispatch_read(channel: &Channel, stages: &[Stage], index: usize, msg: PipelineMessage) {
    if let Some(stage) = stages.get(index) {
        let ctx = HandlerContext { channel, stages, index };
        stage.handler.on_read(&ctx, msg);
    } else {
        trace!(channel = %channel.id(), kind = msg.kind(), "message reached pipeline tail");
    }
}

fn dispatch_event(channel: &Channel, stages: &[Stage], index: usize, event: LifecycleEvent) {
    if let Some(stage) = stages.get(index) {
        let ctx = HandlerContext { channel, stages, index };
        stage.handler.on_event(&ctx, event);
    }
}

fn dispatch_error(channel: &Channel, stages: &[Stage], index: usize, error: GatehouseError) {
    if let Some(stage) = stages.get(index) {
        let ctx = HandlerContext { channel, stages, index };
        stage.handler.on_error(&ctx, error);
    } else {
        warn!(channel = %channel.info(), error = %error, "error reached pipeline tail unhandled");
    }
}

fn dispatch_write(
    channel: &Channel,
    stages: &[Stage],
    below_index: usize,
    msg: PipelineMessage,
) -> GatehouseResult<()> {
    if below_index == 0 {
        return match msg {
            PipelineMessage::Frame(frame) => channel.write(frame),
            other => Err(GatehouseError::internal_fatal(format!(
                "non-frame message reached the transport: {}",
                other.kind()
            ))),
        };
    }
    let index = below_index - 1;
    let ctx = HandlerContext { channel, stages, index };
    stages[index].handler.on_write(&ctx, msg)
}

struct PipelineInner {
    channel: Channel,
    stages: Mutex<Vec<Stage>>,
}

/// Cheap-clone handle to one channel's handler chain.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    fn snapshot(&self) -> Vec<Stage> {
        self.inner.stages.lock().clone()
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Deliver an inbound message to the head of the pipeline.
    pub fn fire_read(&self, msg: PipelineMessage) {
        let stages = self.snapshot();
        dispatch_read(&self.inner.channel, &stages, 0, msg);
    }

    /// Deliver a lifecycle event to the head of the pipeline.
    pub fn fire_event(&self, event: LifecycleEvent) {
        let stages = self.snapshot();
        dispatch_event(&self.inner.channel, &stages, 0, event);
    }

    /// Deliver an error to the head of the pipeline.
    pub fn fire_error(&self, error: GatehouseError) {
        let stages = self.snapshot();
        dispatch_error(&self.inner.channel, &stages, 0, error);
    }

    /// Write an outbound message through the whole chain, tail first.
    pub fn write(&self, msg: PipelineMessage) -> GatehouseResult<()> {
        let stages = self.snapshot();
        dispatch_write(&self.inner.channel, &stages, stages.len(), msg)
    }

    pub fn write_and_flush(&self, msg: PipelineMessage) -> GatehouseResult<()> {
        let result = self.write(msg);
        self.inner.channel.flush();
        result
    }

    /// Swap the stage with the given name for a new handler, keeping its
    /// position. Returns false when no stage has that name.
    pub fn replace(&self, name: &str, handler: Arc<dyn ChannelHandler>) -> bool {
        let mut stages = self.inner.stages.lock();
        match stages.iter_mut().find(|s| s.name == name) {
            Some(stage) => {
                stage.handler = handler;
                true
            }
            None => false,
        }
    }

    /// Append a stage at the tail.
    pub fn add_last(&self, name: &'static str, handler: Arc<dyn ChannelHandler>) {
        self.inner.stages.lock().push(Stage { name, handler });
    }

    /// Drop the stage with the given name.
    pub fn remove(&self, name: &str) -> bool {
        let mut stages = self.inner.stages.lock();
        let before = stages.len();
        stages.retain(|s| s.name != name);
        stages.len() != before
    }

    /// The handler currently installed under a name.
    pub fn handler(&self, name: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.inner
            .stages
            .lock()
            .iter()
            .find(|s| s.name == name)
            .map(|s| Arc::clone(&s.handler))
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.inner.stages.lock().iter().map(|s| s.name).collect()
    }
}

/// Builds a pipeline as an ordered list of named stages.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: &'static str, handler: Arc<dyn ChannelHandler>) -> Self {
        self.stages.push(Stage { name, handler });
        self
    }

    pub fn build(self, channel: Channel) -> Pipeline {
        Pipeline {
            inner: Arc::new(PipelineInner {
                channel,
                stages: Mutex::new(self.stages),
            }),
        }
    }
}

/// Host hook for re-establishing per-request ambient state (task-locals
/// and the like) around downstream dispatch. The default binding runs the
/// continuation directly.
pub trait MethodBinding: Send + Sync {
    fn bind(&self, run: &mut dyn FnMut());
}

/// Pipeline stage wrapping downstream reads and events in a [`MethodBinding`].
pub struct MethodBindingHandler {
    binding: Arc<dyn MethodBinding>,
}

impl MethodBindingHandler {
    pub fn new(binding: Arc<dyn MethodBinding>) -> Self {
        Self { binding }
    }
}

impl ChannelHandler for MethodBindingHandler {
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) {
        let mut msg = Some(msg);
        self.binding.bind(&mut || {
            if let Some(msg) = msg.take() {
                ctx.forward_read(msg);
            }
        });
    }

    fn on_event(&self, ctx: &HandlerContext<'_>, event: LifecycleEvent) {
        self.binding.bind(&mut || ctx.forward_event(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EventLoopId;
    use crate::codec::{BodyChunk, ResponseHead};
    use std::net::SocketAddr;

    struct NullTransport;

    impl crate::channel::Transport for NullTransport {
        fn event_loop(&self) -> EventLoopId {
            EventLoopId(0)
        }
        fn is_open(&self) -> bool {
            true
        }
        fn is_active(&self) -> bool {
            true
        }
        fn write(&self, _frame: HttpFrame) -> GatehouseResult<()> {
            Ok(())
        }
        fn flush(&self) {}
        fn request_read(&self) {}
        fn close(&self) {}
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ChannelHandler for Recorder {
        fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) {
            self.log.lock().push(format!("read:{}", self.label));
            ctx.forward_read(msg);
        }

        fn on_write(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) -> GatehouseResult<()> {
            self.log.lock().push(format!("write:{}", self.label));
            ctx.write(msg)
        }
    }

    fn recorder(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn ChannelHandler> {
        Arc::new(Recorder {
            label,
            log: Arc::clone(log),
        })
    }

    fn pipeline(log: &Arc<Mutex<Vec<String>>>) -> Pipeline {
        PipelineBuilder::new()
            .add("a", recorder("a", log))
            .add("b", recorder("b", log))
            .add("c", recorder("c", log))
            .build(Channel::new(Box::new(NullTransport)))
    }

    #[test]
    fn test_reads_traverse_head_to_tail() {
        let log = Arc::new(Mutex::new(Vec::new()));
        pipeline(&log).fire_read(PipelineMessage::Frame(HttpFrame::Content(
            BodyChunk::empty_last(),
        )));
        assert_eq!(*log.lock(), vec!["read:a", "read:b", "read:c"]);
    }

    #[test]
    fn test_writes_traverse_tail_to_head() {
        let log = Arc::new(Mutex::new(Vec::new()));
        pipeline(&log)
            .write(PipelineMessage::Frame(HttpFrame::ResponseHead(
                ResponseHead::new("HTTP/1.1", 200),
            )))
            .unwrap();
        assert_eq!(*log.lock(), vec!["write:c", "write:b", "write:a"]);
    }

    #[test]
    fn test_replace_keeps_position() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let p = pipeline(&log);
        assert!(p.replace("b", recorder("b2", &log)));
        assert!(!p.replace("missing", recorder("x", &log)));
        p.fire_read(PipelineMessage::Frame(HttpFrame::Content(
            BodyChunk::empty_last(),
        )));
        assert_eq!(*log.lock(), vec!["read:a", "read:b2", "read:c"]);
        assert_eq!(p.stage_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_non_frame_write_at_head_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let p = pipeline(&log);
        let request = Arc::new(crate::request::RequestMessage::new(
            crate::session::SessionContext::new(),
            "HTTP/1.1",
            "get",
            "/",
            crate::headers::QueryParams::default(),
            crate::headers::Headers::new(),
            "127.0.0.1",
            "http",
            80,
            "edge",
        ));
        let err = p.write(PipelineMessage::Request(request)).unwrap_err();
        assert!(err.is_fatal());
    }
}
