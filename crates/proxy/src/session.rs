//! Per-request session context.
//!
//! The context travels with a request through the filter pipeline. It is
//! cheap to clone (all clones share state), carries the session UUID, the
//! cancellation latch, debug capture, and an opaque typed store for
//! collaborator state.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gatehouse_common::SessionId;

use crate::channel::{AttrKey, AttrTable};

/// Well-known session store keys used by the proxy core.
pub mod keys {
    use super::AttrKey;
    use crate::channel::{Channel, TlsHandshakeInfo};
    use crate::codec::RequestHead;
    use crate::passport::Passport;

    /// The inbound channel the request arrived on.
    pub static ENGINE_CHANNEL: AttrKey<Channel> = AttrKey::new("engine_channel");
    /// The native decoded request head, kept for response construction.
    pub static ENGINE_HTTP_REQUEST: AttrKey<RequestHead> = AttrKey::new("engine_http_request");
    /// TLS handshake info when the request arrived over TLS.
    pub static TLS_HANDSHAKE_INFO: AttrKey<TlsHandshakeInfo> = AttrKey::new("tls_handshake_info");
    /// Lifecycle trace shared with the channel.
    pub static PASSPORT: AttrKey<Passport> = AttrKey::new("passport");
}

struct SessionInner {
    uuid: SessionId,
    cancelled: AtomicBool,
    debug_request: AtomicBool,
    endpoint: Mutex<Option<String>>,
    request_debug: Mutex<Vec<String>>,
    routing_debug: Mutex<Vec<String>>,
    store: AttrTable,
}

/// Shared per-request context. Clones refer to the same session.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<SessionInner>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                uuid: SessionId::new(),
                cancelled: AtomicBool::new(false),
                debug_request: AtomicBool::new(false),
                endpoint: Mutex::new(None),
                request_debug: Mutex::new(Vec::new()),
                routing_debug: Mutex::new(Vec::new()),
                store: AttrTable::new(),
            }),
        }
    }

    pub fn uuid(&self) -> &SessionId {
        &self.inner.uuid
    }

    /// Mark the session cancelled. After this, late body chunks for the
    /// request must be dropped instead of forwarded.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn set_debug_request(&self, enabled: bool) {
        self.inner.debug_request.store(enabled, Ordering::Relaxed);
    }

    pub fn debug_request(&self) -> bool {
        self.inner.debug_request.load(Ordering::Relaxed)
    }

    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        *self.inner.endpoint.lock() = Some(endpoint.into());
    }

    pub fn endpoint(&self) -> Option<String> {
        self.inner.endpoint.lock().clone()
    }

    pub fn add_request_debug(&self, line: impl Into<String>) {
        self.inner.request_debug.lock().push(line.into());
    }

    pub fn request_debug(&self) -> Vec<String> {
        self.inner.request_debug.lock().clone()
    }

    pub fn add_routing_debug(&self, line: impl Into<String>) {
        self.inner.routing_debug.lock().push(line.into());
    }

    pub fn routing_debug(&self) -> Vec<String> {
        self.inner.routing_debug.lock().clone()
    }

    /// Opaque typed store for collaborator state.
    pub fn store(&self) -> &AttrTable {
        &self.inner.store
    }

    /// Whether two handles refer to the same session.
    pub fn same_session(&self, other: &SessionContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("uuid", &self.inner.uuid)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Host hook run over every fresh session context before the request is
/// built, letting the host inject standardized keys.
pub trait SessionDecorator: Send + Sync {
    fn decorate(&self, context: SessionContext) -> SessionContext;
}
