//! A pooled connection to one origin server.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::config::ConnectionPoolConfig;
use crate::discovery::Server;
use crate::pipeline::Pipeline;
use crate::stats::ServerStats;

/// Where a connection is in its life.
///
/// Exactly one state holds at any instant: a connection is serving a
/// request, sitting in an idle deque, or closed. It never returns to
/// connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    InUse,
    Idle,
    Closed,
}

struct ConnInner {
    channel: Channel,
    pipeline: Pipeline,
    server: Server,
    config: Arc<ConnectionPoolConfig>,
    stats: Arc<ServerStats>,
    state: Mutex<ConnState>,
    usage_count: AtomicU32,
    request_timer_start: Mutex<Option<Instant>>,
}

/// Cheap-clone handle to one open origin channel.
///
/// The channel is owned exclusively by this connection until closed.
/// `close` is idempotent; the first call transitions to `Closed`, closes
/// the channel, and gives back the open-connection gauge.
#[derive(Clone)]
pub struct OriginConnection {
    inner: Arc<ConnInner>,
}

impl OriginConnection {
    pub(crate) fn new(
        channel: Channel,
        pipeline: Pipeline,
        server: Server,
        config: Arc<ConnectionPoolConfig>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                channel,
                pipeline,
                server,
                config,
                stats,
                state: Mutex::new(ConnState::InUse),
                usage_count: AtomicU32::new(0),
                request_timer_start: Mutex::new(None),
            }),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn server(&self) -> &Server {
        &self.inner.server
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.inner.config
    }

    pub(crate) fn stats(&self) -> &Arc<ServerStats> {
        &self.inner.stats
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.lock()
    }

    /// True iff this connection currently sits in an idle deque.
    pub fn in_pool(&self) -> bool {
        self.state() == ConnState::Idle
    }

    /// True iff this connection is currently serving a request.
    pub fn in_use(&self) -> bool {
        self.state() == ConnState::InUse
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    /// Whether the underlying channel reports both active and open.
    pub fn is_live(&self) -> bool {
        !self.is_closed() && self.inner.channel.is_active() && self.inner.channel.is_open()
    }

    pub(crate) fn set_in_use(&self) {
        let mut state = self.inner.state.lock();
        if *state != ConnState::Closed {
            *state = ConnState::InUse;
        }
    }

    /// Idle -> InUse, when popped from an idle deque.
    pub(crate) fn mark_taken(&self) {
        let mut state = self.inner.state.lock();
        if *state == ConnState::Idle {
            *state = ConnState::InUse;
        }
    }

    /// InUse -> Idle, when accepted back into an idle deque.
    pub(crate) fn mark_idle(&self) {
        let mut state = self.inner.state.lock();
        if *state == ConnState::InUse {
            *state = ConnState::Idle;
        }
    }

    /// Close this connection. The second and later calls are no-ops.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnState::Closed {
                return;
            }
            *state = ConnState::Closed;
        }
        self.inner.channel.close();
        self.inner.stats.dec_open_connections();
    }

    /// Times this connection has been handed out.
    pub fn usage_count(&self) -> u32 {
        self.inner.usage_count.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_usage_count(&self) {
        self.inner.usage_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn start_request_timer(&self) {
        *self.inner.request_timer_start.lock() = Some(Instant::now());
    }

    /// Stop the request timer, returning the elapsed time if it was running.
    pub(crate) fn stop_request_timer(&self) -> Option<Duration> {
        self.inner
            .request_timer_start
            .lock()
            .take()
            .map(|start| start.elapsed())
    }

    /// End the current request/response cycle on this connection: stops
    /// the timer and gives back the active-request gauge, exactly once
    /// per started timer.
    pub(crate) fn finish_request(&self) -> Option<Duration> {
        let elapsed = self.stop_request_timer();
        if elapsed.is_some() {
            self.inner.stats.dec_active_requests();
        }
        elapsed
    }

    /// Whether two handles refer to the same connection.
    pub fn same_connection(&self, other: &OriginConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for OriginConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginConnection")
            .field("server", &self.inner.server.to_string())
            .field("channel", &self.inner.channel.id())
            .field("state", &self.state())
            .field("usage_count", &self.usage_count())
            .finish()
    }
}
