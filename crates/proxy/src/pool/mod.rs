//! Per-origin connection pooling.
//!
//! The pool hands out connections with at-most-one concurrent user each,
//! partitioning idle connections by the event loop of the caller. The hot
//! path (acquire on the loop that released) touches only that loop's
//! deque, giving de facto single-writer behavior without a central lock.
//! Cross-loop interaction is limited to `remove` and `shutdown`.

mod connection;
pub mod factory;
pub mod initializer;

pub use connection::{ConnState, OriginConnection};
pub use factory::{ConnectionFactory, Connector, OriginChannel, StreamTransport, TcpConnector};
pub use initializer::OutboundPipelineInitializer;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use gatehouse_common::{GatehouseError, GatehouseResult};

use crate::channel::EventLoopId;
use crate::config::ConnectionPoolConfig;
use crate::discovery::Server;
use crate::passport::{Passport, PassportState};
use crate::stats::{PoolCounters, ServerStats};
use crate::timeout::IdleTimeoutHandler;

type IdleDeque = Arc<Mutex<VecDeque<OriginConnection>>>;

/// Connection pool for a single origin [`Server`].
///
/// Idle connections are reused most-recent-first per event loop. Gauges
/// and counters are atomics; their cross-field consistency is eventual
/// and they are never used for synchronization.
pub struct PerServerConnectionPool {
    server: Server,
    stats: Arc<ServerStats>,
    factory: Arc<ConnectionFactory>,
    config: Arc<ConnectionPoolConfig>,
    counters: Arc<PoolCounters>,
    per_loop_idle: DashMap<EventLoopId, IdleDeque>,
    conns_in_pool: AtomicI64,
    conns_in_use: AtomicI64,
    conn_creations_in_progress: AtomicI64,
    weak_self: Weak<PerServerConnectionPool>,
}

impl PerServerConnectionPool {
    pub fn new(
        server: Server,
        stats: Arc<ServerStats>,
        factory: Arc<ConnectionFactory>,
        config: Arc<ConnectionPoolConfig>,
        counters: Arc<PoolCounters>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            server,
            stats,
            factory,
            config,
            counters,
            per_loop_idle: DashMap::new(),
            conns_in_pool: AtomicI64::new(0),
            conns_in_use: AtomicI64::new(0),
            conn_creations_in_progress: AtomicI64::new(0),
            weak_self: weak.clone(),
        })
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn counters(&self) -> &PoolCounters {
        &self.counters
    }

    pub fn conns_in_pool(&self) -> i64 {
        self.conns_in_pool.load(Ordering::Acquire)
    }

    pub fn conns_in_use(&self) -> i64 {
        self.conns_in_use.load(Ordering::Acquire)
    }

    pub fn conn_creations_in_progress(&self) -> i64 {
        self.conn_creations_in_progress.load(Ordering::Acquire)
    }

    /// Acquire a connection for one request attempt.
    ///
    /// A pooled connection is returned without awaiting; otherwise a fresh
    /// connect is dispatched. The pool never retries: a failed connect
    /// surfaces to the caller, which owns retry policy across servers.
    pub async fn acquire(
        &self,
        event_loop: EventLoopId,
        http_method: &str,
        uri: &str,
        attempt: u32,
        passport: &Passport,
    ) -> GatehouseResult<OriginConnection> {
        self.counters.inc_request_conn();

        if let Some(conn) = self.try_from_pool(event_loop) {
            conn.start_request_timer();
            self.stats.inc_active_requests();
            conn.increment_usage_count();
            conn.channel().request_read();
            self.on_acquire(&conn, http_method, uri, attempt, passport);
            return Ok(conn);
        }

        self.make_new_connection(event_loop, http_method, uri, attempt, passport)
            .await
    }

    /// The idle deque for an event loop, created on first touch. Under a
    /// race both callers construct one and the map keeps a single winner.
    fn idle_deque(&self, event_loop: EventLoopId) -> IdleDeque {
        self.per_loop_idle
            .entry(event_loop)
            .or_default()
            .clone()
    }

    /// Pop idle connections until a live one turns up. Dead ones are
    /// counted, closed, and skipped.
    fn try_from_pool(&self, event_loop: EventLoopId) -> Option<OriginConnection> {
        let deque = self.idle_deque(event_loop);
        loop {
            let conn = deque.lock().pop_front()?;
            if conn.is_live() {
                conn.mark_taken();
                self.counters.inc_reuse_conn();
                self.conns_in_use.fetch_add(1, Ordering::AcqRel);
                self.conns_in_pool.fetch_sub(1, Ordering::AcqRel);
                return Some(conn);
            }
            self.counters.inc_conn_taken_from_pool_not_open();
            self.conns_in_pool.fetch_sub(1, Ordering::AcqRel);
            conn.close();
        }
    }

    /// Runs when a connection is acquired, before returning it to the
    /// caller: attaches the passport, reinstalls the idle stage so the
    /// timer measures idleness since last use, and marks the connection
    /// in use.
    fn on_acquire(
        &self,
        conn: &OriginConnection,
        http_method: &str,
        uri: &str,
        attempt: u32,
        passport: &Passport,
    ) {
        passport.attach_to_channel(conn.channel());
        IdleTimeoutHandler::install(conn.pipeline(), self.config.idle_timeout());
        conn.set_in_use();
        debug!(
            origin = %self.config.origin_name,
            conn = ?conn,
            method = http_method,
            uri,
            attempt,
            "origin connection acquired"
        );
    }

    async fn make_new_connection(
        &self,
        event_loop: EventLoopId,
        http_method: &str,
        uri: &str,
        attempt: u32,
        passport: &Passport,
    ) -> GatehouseResult<OriginConnection> {
        // Enforce the per-host ceiling over open plus opening connections.
        let max = self.config.max_connections_per_host;
        let open_and_opening =
            self.stats.open_connections() + self.conn_creations_in_progress.load(Ordering::Acquire);
        if max >= 0 && open_and_opening >= max as i64 {
            self.counters.inc_max_conns_per_host_exceeded();
            warn!(
                origin = %self.config.origin_name,
                host = self.server.host(),
                limit = max,
                open_and_opening,
                "not creating connection: at max connections per host"
            );
            return Err(GatehouseError::max_connections(max, open_and_opening));
        }

        self.counters.inc_create_new_conn();
        self.conn_creations_in_progress.fetch_add(1, Ordering::AcqRel);
        passport.add(PassportState::OriginChConnecting);

        // The connect runs in its own task so completion accounting
        // happens exactly once even when the caller stops waiting.
        let (tx, rx) = oneshot::channel();
        let pool = self
            .weak_self
            .upgrade()
            .ok_or_else(|| GatehouseError::internal("connection pool dropped"))?;
        let task_passport = passport.clone();
        let method = http_method.to_string();
        let uri = uri.to_string();
        tokio::spawn(async move {
            let connected = pool.factory.connect(&pool.server, event_loop).await;
            match pool.handle_connect_completion(connected, &method, &uri, attempt, &task_passport)
            {
                Ok(conn) => {
                    if let Err(Ok(conn)) = tx.send(Ok(conn)) {
                        // Caller went away mid-connect. The connection is
                        // healthy and freshly established, so pool it.
                        conn.finish_request();
                        pool.release(conn);
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                }
            }
        });

        rx.await
            .map_err(|_| GatehouseError::internal("origin connect task dropped"))?
    }

    fn handle_connect_completion(
        &self,
        connected: io::Result<OriginChannel>,
        http_method: &str,
        uri: &str,
        attempt: u32,
        passport: &Passport,
    ) -> GatehouseResult<OriginConnection> {
        self.conn_creations_in_progress.fetch_sub(1, Ordering::AcqRel);

        match connected {
            Ok(origin_channel) => {
                passport.add(PassportState::OriginChConnected);
                self.stats.inc_open_connections();
                self.stats.inc_active_requests();
                self.counters.inc_create_conn_succeeded();
                self.conns_in_use.fetch_add(1, Ordering::AcqRel);

                let conn = OriginConnection::new(
                    origin_channel.channel,
                    origin_channel.pipeline,
                    self.server.clone(),
                    Arc::clone(&self.config),
                    Arc::clone(&self.stats),
                );
                origin_channel
                    .pool_slot
                    .bind(self.weak_self.clone(), conn.clone());

                conn.increment_usage_count();
                conn.start_request_timer();
                conn.channel().request_read();
                self.on_acquire(&conn, http_method, uri, attempt, passport);
                Ok(conn)
            }
            Err(cause) => {
                self.stats.note_connect_failure();
                self.counters.inc_create_conn_failed();
                warn!(
                    origin = %self.config.origin_name,
                    host = self.server.host(),
                    error = %cause,
                    "error creating origin connection"
                );
                Err(GatehouseError::connect(cause.to_string(), Some(Box::new(cause))))
            }
        }
    }

    /// Return a connection to the idle pool for its event loop.
    ///
    /// Returns false when the connection is rejected (already pooled or
    /// closed) or discarded at the waterline; a discarded connection is
    /// closed here.
    pub fn release(&self, conn: OriginConnection) -> bool {
        if conn.in_pool() || conn.is_closed() {
            return false;
        }

        let passport = Passport::from_channel(conn.channel());
        let deque = self.idle_deque(conn.channel().event_loop());
        let waterline = self.config.per_server_waterline;
        let was_in_use = conn.in_use();

        {
            let mut idle = deque.lock();
            if waterline >= 0 && idle.len() >= waterline as usize {
                drop(idle);
                // Above the waterline for this loop: close instead of pooling.
                conn.close();
                if was_in_use {
                    self.conns_in_use.fetch_sub(1, Ordering::AcqRel);
                }
                return false;
            }
            conn.mark_idle();
            idle.push_front(conn.clone());
        }

        if was_in_use {
            self.conns_in_use.fetch_sub(1, Ordering::AcqRel);
        }
        self.conns_in_pool.fetch_add(1, Ordering::AcqRel);
        passport.add(PassportState::OriginChPoolReturned);
        true
    }

    /// Pull a specific connection out of the idle pool.
    ///
    /// A pooled connection always sits in the deque for its own channel's
    /// event loop (release keys by that), so that is the only deque to
    /// search.
    pub fn remove(&self, conn: &OriginConnection) -> bool {
        if !conn.in_pool() {
            return false;
        }

        let deque = self.idle_deque(conn.channel().event_loop());
        let removed = {
            let mut idle = deque.lock();
            match idle.iter().position(|c| c.same_connection(conn)) {
                Some(index) => {
                    idle.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            conn.mark_taken();
            self.conns_in_pool.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Bookkeeping for an in-use connection that is being closed without
    /// re-entering the pool.
    pub(crate) fn note_in_use_closed(&self, conn: &OriginConnection) {
        if conn.in_use() {
            self.conns_in_use.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Close every pooled connection. Safe to call more than once.
    pub fn shutdown(&self) {
        for entry in self.per_loop_idle.iter() {
            for conn in entry.value().lock().iter() {
                conn.close();
            }
        }
    }
}
