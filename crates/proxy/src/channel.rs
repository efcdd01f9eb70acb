//! Channel handle, transport boundary, and per-channel attributes.
//!
//! A [`Channel`] is the proxy core's view of one open connection, inbound or
//! outbound. The raw socket engine and the HTTP codec live behind the
//! [`Transport`] trait; everything above it deals in frames.
//!
//! Per-channel state that belongs to no single handler lives in a typed
//! attribute table keyed by [`AttrKey`], replacing stringly-typed side maps
//! with compile-time checked lookups.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use gatehouse_common::GatehouseResult;

use crate::codec::HttpFrame;

/// Identity of the single-threaded I/O worker a channel is bound to.
///
/// All handler callbacks for a channel run serially on its event loop;
/// the connection pool partitions idle connections by this identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventLoopId(pub usize);

impl fmt::Display for EventLoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

/// Process-unique channel identifier, used only for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Boundary to the socket engine and HTTP codec (both external).
///
/// `write` enqueues an already-framed message for encoding; `request_read`
/// asks the engine to deliver the next inbound message when one arrives.
/// `close` must be idempotent; closing the underlying socket exactly once
/// is the implementor's responsibility.
pub trait Transport: Send + Sync {
    fn event_loop(&self) -> EventLoopId;
    fn is_open(&self) -> bool;
    fn is_active(&self) -> bool;
    fn write(&self, frame: HttpFrame) -> GatehouseResult<()>;
    fn flush(&self);
    fn request_read(&self);
    fn close(&self);
    fn local_addr(&self) -> Option<SocketAddr>;
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Typed key into a channel's attribute table.
///
/// Keys are declared as statics; the type parameter ties each key to the
/// one value type it may hold.
pub struct AttrKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttrKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Typed per-channel side table.
#[derive(Default)]
pub struct AttrTable {
    slots: Mutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

impl AttrTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under a key, replacing any previous value.
    pub fn set<T: Send + Sync + 'static>(&self, key: &AttrKey<T>, value: T) {
        self.set_arc(key, Arc::new(value));
    }

    /// Store an already-shared value under a key.
    pub fn set_arc<T: Send + Sync + 'static>(&self, key: &AttrKey<T>, value: Arc<T>) {
        self.slots.lock().insert(key.name, value);
    }

    /// Fetch the value for a key, if set.
    pub fn get<T: Send + Sync + 'static>(&self, key: &AttrKey<T>) -> Option<Arc<T>> {
        self.slots
            .lock()
            .get(key.name)
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Remove the value for a key, returning it if it was set.
    pub fn remove<T: Send + Sync + 'static>(&self, key: &AttrKey<T>) -> Option<Arc<T>> {
        self.slots
            .lock()
            .remove(key.name)
            .and_then(|any| any.downcast::<T>().ok())
    }
}

/// TLS handshake outcome extracted by the (external) TLS layer and stored
/// on the channel as an opaque attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsHandshakeInfo {
    pub protocol: String,
    pub cipher_suite: String,
}

/// Well-known channel attribute keys used by the proxy core.
pub mod attrs {
    use super::{AttrKey, TlsHandshakeInfo};
    use crate::passport::Passport;
    use crate::request::RequestMessage;
    use crate::response::ResponseMessage;

    /// The in-flight request built by the request receiver.
    pub static GATE_REQUEST: AttrKey<RequestMessage> = AttrKey::new("gate_request");
    /// The in-flight response stored by the response writer.
    pub static GATE_RESPONSE: AttrKey<ResponseMessage> = AttrKey::new("gate_response");
    /// Client IP as seen by the address handler (proxy protocol aware).
    pub static SOURCE_ADDRESS: AttrKey<String> = AttrKey::new("source_address");
    /// Local port the request arrived on.
    pub static LOCAL_PORT: AttrKey<u16> = AttrKey::new("local_port");
    /// Local address text the request arrived on.
    pub static LOCAL_ADDRESS: AttrKey<String> = AttrKey::new("local_address");
    /// TLS handshake info, present only on TLS channels.
    pub static TLS_INFO: AttrKey<TlsHandshakeInfo> = AttrKey::new("tls_info");
    /// Negotiated protocol name (e.g. ALPN-derived "HTTP/2").
    pub static PROTOCOL_NAME: AttrKey<String> = AttrKey::new("protocol_name");
    /// Lifecycle trace for this channel.
    pub static PASSPORT: AttrKey<Passport> = AttrKey::new("passport");
}

struct ChannelInner {
    id: ChannelId,
    transport: Box<dyn Transport>,
    attrs: AttrTable,
    closed: AtomicBool,
}

/// Cheap-clone handle to one open connection.
///
/// The channel owns its transport exclusively until closed. `close` is
/// idempotent from the caller's perspective and reaches the transport
/// exactly once.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id: ChannelId::next(),
                transport,
                attrs: AttrTable::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn event_loop(&self) -> EventLoopId {
        self.inner.transport.event_loop()
    }

    pub fn attrs(&self) -> &AttrTable {
        &self.inner.attrs
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && self.inner.transport.is_open()
    }

    pub fn is_active(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && self.inner.transport.is_active()
    }

    pub fn write(&self, frame: HttpFrame) -> GatehouseResult<()> {
        self.inner.transport.write(frame)
    }

    pub fn flush(&self) {
        self.inner.transport.flush();
    }

    /// Ask the engine to deliver the next inbound message.
    pub fn request_read(&self) {
        self.inner.transport.request_read();
    }

    /// Close the channel. Subsequent calls are no-ops.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.transport.close();
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.peer_addr()
    }

    /// Whether two handles refer to the same channel.
    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// One-line channel description for log messages.
    pub fn info(&self) -> String {
        format!(
            "{} [{}] remote={} local={}",
            self.inner.id,
            self.event_loop(),
            self.inner
                .transport
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            self.inner
                .transport
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        )
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("event_loop", &self.event_loop())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static COUNT: AttrKey<u32> = AttrKey::new("count");
    static LABEL: AttrKey<String> = AttrKey::new("label");

    #[test]
    fn test_attr_table_round_trip() {
        let table = AttrTable::new();
        table.set(&COUNT, 7);
        table.set(&LABEL, "edge".to_string());

        assert_eq!(*table.get(&COUNT).unwrap(), 7);
        assert_eq!(*table.get(&LABEL).unwrap(), "edge");
    }

    #[test]
    fn test_attr_table_replace_and_remove() {
        let table = AttrTable::new();
        table.set(&COUNT, 1);
        table.set(&COUNT, 2);
        assert_eq!(*table.get(&COUNT).unwrap(), 2);

        assert_eq!(*table.remove(&COUNT).unwrap(), 2);
        assert!(table.get(&COUNT).is_none());
    }

    #[test]
    fn test_missing_attr_is_none() {
        let table = AttrTable::new();
        assert!(table.get(&COUNT).is_none());
        assert!(table.remove(&LABEL).is_none());
    }
}
