//! The in-memory request object flowing through the filter pipeline.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::codec::BodyChunk;
use crate::headers::{Headers, QueryParams};
use crate::session::SessionContext;

pub const SCHEME_HTTP: &str = "http";
pub const SCHEME_HTTPS: &str = "https";

/// Immutable snapshot of the inbound request, captured before filters run.
/// Kept for response construction, metrics, and access logging.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub protocol: String,
    pub method: String,
    pub path: String,
    pub query: QueryParams,
    pub headers: Headers,
    pub client_ip: String,
    pub scheme: String,
    pub port: u16,
    pub server_name: String,
}

/// One inbound HTTP transaction, materialized from decoded frames.
///
/// Built by the request receiver and fired into the filter pipeline.
/// Headers stay mutable behind a lock because filters rewrite them; the
/// scalar fields are fixed at construction.
pub struct RequestMessage {
    context: SessionContext,
    protocol: String,
    method: String,
    path: String,
    query: QueryParams,
    headers: Mutex<Headers>,
    client_ip: String,
    scheme: String,
    port: u16,
    server_name: String,
    has_body: AtomicBool,
    body: Mutex<Vec<BodyChunk>>,
    inbound_info: Mutex<Option<RequestInfo>>,
}

impl RequestMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: SessionContext,
        protocol: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        query: QueryParams,
        headers: Headers,
        client_ip: impl Into<String>,
        scheme: impl Into<String>,
        port: u16,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            context,
            protocol: protocol.into(),
            method: method.into(),
            path: path.into(),
            query,
            headers: Mutex::new(headers),
            client_ip: client_ip.into(),
            scheme: scheme.into(),
            port,
            server_name: server_name.into(),
            has_body: AtomicBool::new(false),
            body: Mutex::new(Vec::new()),
            inbound_info: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// ASCII-lowercased request method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request path with the query string stripped.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    pub fn headers(&self) -> parking_lot::MutexGuard<'_, Headers> {
        self.headers.lock()
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// True iff the headers promised a body (chunked or non-zero length).
    /// The receiver may flip this later when a chunked request turns out to
    /// carry only a bare last-content marker.
    pub fn has_body(&self) -> bool {
        self.has_body.load(Ordering::Relaxed)
    }

    pub fn set_has_body(&self, has_body: bool) {
        self.has_body.store(has_body, Ordering::Relaxed);
    }

    /// Append a body chunk received before the filters asked for the body.
    pub fn buffer_body_chunk(&self, chunk: BodyChunk) {
        self.body.lock().push(chunk);
    }

    /// Snapshot of the buffered body chunks; payloads are retained, not copied.
    pub fn body_chunks(&self) -> Vec<BodyChunk> {
        self.body.lock().clone()
    }

    /// Drop every buffered chunk, releasing the payloads.
    pub fn dispose_buffered_body(&self) {
        self.body.lock().clear();
    }

    /// Capture the inbound snapshot. Called once, before filters mutate
    /// the message.
    pub fn store_inbound_request(&self) {
        let info = RequestInfo {
            protocol: self.protocol.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            headers: self.headers.lock().clone(),
            client_ip: self.client_ip.clone(),
            scheme: self.scheme.clone(),
            port: self.port,
            server_name: self.server_name.clone(),
        };
        *self.inbound_info.lock() = Some(info);
    }

    pub fn inbound_info(&self) -> Option<RequestInfo> {
        self.inbound_info.lock().clone()
    }
}

impl std::fmt::Debug for RequestMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMessage")
            .field("uuid", self.context.uuid())
            .field("method", &self.method)
            .field("path", &self.path)
            .field("protocol", &self.protocol)
            .field("has_body", &self.has_body())
            .finish()
    }
}

/// Whether the headers carry `Transfer-Encoding: chunked`.
pub fn has_chunked_transfer_encoding(headers: &Headers) -> bool {
    headers
        .all("transfer-encoding")
        .iter()
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// Whether the headers carry a parseable, non-zero `Content-Length`.
pub fn has_nonzero_content_length(headers: &Headers) -> bool {
    headers
        .first("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .is_some_and(|n| n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message() -> RequestMessage {
        RequestMessage::new(
            SessionContext::new(),
            "HTTP/1.1",
            "post",
            "/submit",
            QueryParams::parse(Some("retry=1")),
            Headers::new(),
            "10.0.0.9",
            SCHEME_HTTP,
            8080,
            "gateway.local",
        )
    }

    #[test]
    fn test_body_detection_helpers() {
        let mut headers = Headers::new();
        assert!(!has_chunked_transfer_encoding(&headers));
        assert!(!has_nonzero_content_length(&headers));

        headers.add("Transfer-Encoding", "Chunked");
        assert!(has_chunked_transfer_encoding(&headers));

        let mut sized = Headers::new();
        sized.add("Content-Length", "0");
        assert!(!has_nonzero_content_length(&sized));
        sized.set("Content-Length", "12");
        assert!(has_nonzero_content_length(&sized));
    }

    #[test]
    fn test_buffered_body_dispose() {
        let req = message();
        req.buffer_body_chunk(BodyChunk::new(Bytes::from_static(b"abc")));
        req.buffer_body_chunk(BodyChunk::last(Bytes::from_static(b"def")));
        assert_eq!(req.body_chunks().len(), 2);

        req.dispose_buffered_body();
        assert!(req.body_chunks().is_empty());
    }

    #[test]
    fn test_inbound_snapshot_is_pre_mutation() {
        let req = message();
        req.headers().add("Host", "gateway.local");
        req.store_inbound_request();

        req.headers().set("Host", "rewritten.internal");

        let info = req.inbound_info().unwrap();
        assert_eq!(info.headers.first("host"), Some("gateway.local"));
        assert_eq!(info.method, "post");
        assert_eq!(info.query.first("retry"), Some("1"));
    }
}
