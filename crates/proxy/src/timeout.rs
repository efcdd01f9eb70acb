//! Idle-timeout pipeline stage.
//!
//! Fires an [`LifecycleEvent::IdleState`] when a channel has seen no reads
//! or writes for the configured window. The stage is installed under a
//! fixed name so the pool can swap in a fresh instance on every acquire,
//! making the timer measure idleness since last use rather than since the
//! channel opened.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::pipeline::{
    ChannelHandler, HandlerContext, LifecycleEvent, Pipeline, PipelineMessage,
};

/// Stage name the idle handler is installed under.
pub const IDLE_STAGE: &str = "idle";

pub struct IdleTimeoutHandler {
    timeout: Duration,
    armed_at: Instant,
    last_activity: Mutex<Instant>,
}

impl IdleTimeoutHandler {
    fn new(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            timeout,
            armed_at: now,
            last_activity: Mutex::new(now),
        }
    }

    /// A disabled placeholder, used to reserve the stage position while
    /// the pipeline is being built.
    pub(crate) fn inert() -> Arc<IdleTimeoutHandler> {
        Arc::new(IdleTimeoutHandler::new(Duration::ZERO))
    }

    /// Install a fresh idle stage into `pipeline` (replacing the current
    /// one if present) and start its timer.
    pub fn install(pipeline: &Pipeline, timeout: Duration) -> Arc<IdleTimeoutHandler> {
        let handler = Arc::new(IdleTimeoutHandler::new(timeout));
        let stage: Arc<dyn ChannelHandler> = handler.clone();
        if !pipeline.replace(IDLE_STAGE, Arc::clone(&stage)) {
            pipeline.add_last(IDLE_STAGE, stage);
        }
        Arc::clone(&handler).arm(pipeline.clone());
        handler
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// When this instance was installed. A reinstall yields a later value.
    pub fn armed_at(&self) -> Instant {
        self.armed_at
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn arm(self: Arc<Self>, pipeline: Pipeline) {
        if self.timeout.is_zero() {
            return;
        }
        // Without a runtime (plain unit tests) the stage is inert.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let me = self;
        runtime.spawn(async move {
            loop {
                let deadline = *me.last_activity.lock() + me.timeout;
                if Instant::now() >= deadline {
                    if still_installed(&pipeline, &me) {
                        pipeline.fire_event(LifecycleEvent::IdleState);
                    }
                    return;
                }
                tokio::time::sleep_until(deadline).await;
            }
        });
    }
}

fn still_installed(pipeline: &Pipeline, me: &Arc<IdleTimeoutHandler>) -> bool {
    pipeline
        .handler(IDLE_STAGE)
        .is_some_and(|current| Arc::as_ptr(&current) as *const () == Arc::as_ptr(me) as *const ())
}

impl ChannelHandler for IdleTimeoutHandler {
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) {
        self.touch();
        ctx.forward_read(msg);
    }

    fn on_write(
        &self,
        ctx: &HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> gatehouse_common::GatehouseResult<()> {
        self.touch();
        ctx.write(msg)
    }
}
