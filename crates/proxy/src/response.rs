//! The in-memory response object produced by the filter pipeline.

use parking_lot::Mutex;

use crate::codec::BodyChunk;
use crate::headers::Headers;
use crate::request::{RequestInfo, RequestMessage};
use crate::session::SessionContext;

/// One outbound HTTP response, handed to the response writer for
/// serialization back to the client.
///
/// Body content is zero or more reference-counted chunks; writing retains
/// them, disposal releases them.
pub struct ResponseMessage {
    context: SessionContext,
    status: u16,
    headers: Mutex<Headers>,
    body: Mutex<Vec<BodyChunk>>,
    inbound_request: Option<RequestInfo>,
}

impl ResponseMessage {
    pub fn new(context: SessionContext, status: u16) -> Self {
        Self {
            context,
            status,
            headers: Mutex::new(Headers::new()),
            body: Mutex::new(Vec::new()),
            inbound_request: None,
        }
    }

    /// Build a response correlated with the request it answers.
    pub fn from_request(request: &RequestMessage, status: u16) -> Self {
        Self {
            context: request.context().clone(),
            status,
            headers: Mutex::new(Headers::new()),
            body: Mutex::new(Vec::new()),
            inbound_request: request.inbound_info(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> parking_lot::MutexGuard<'_, Headers> {
        self.headers.lock()
    }

    /// Append a buffered body chunk.
    pub fn buffer_body_chunk(&self, chunk: BodyChunk) {
        self.body.lock().push(chunk);
    }

    /// Snapshot of the buffered chunks; payloads are retained, not copied.
    pub fn body_chunks(&self) -> Vec<BodyChunk> {
        self.body.lock().clone()
    }

    /// Drop every buffered chunk, releasing the payloads.
    pub fn dispose_buffered_body(&self) {
        self.body.lock().clear();
    }

    /// The inbound request this response answers, when known.
    pub fn inbound_request(&self) -> Option<&RequestInfo> {
        self.inbound_request.as_ref()
    }
}

impl std::fmt::Debug for ResponseMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseMessage")
            .field("uuid", self.context.uuid())
            .field("status", &self.status)
            .field("buffered_chunks", &self.body.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::QueryParams;
    use bytes::Bytes;

    #[test]
    fn test_from_request_captures_inbound_info() {
        let request = RequestMessage::new(
            SessionContext::new(),
            "HTTP/1.1",
            "get",
            "/health",
            QueryParams::default(),
            Headers::new(),
            "10.1.1.1",
            "http",
            80,
            "edge",
        );
        request.store_inbound_request();

        let response = ResponseMessage::from_request(&request, 200);
        assert_eq!(response.status(), 200);
        assert!(response.context().same_session(request.context()));
        assert_eq!(response.inbound_request().unwrap().path, "/health");
    }

    #[test]
    fn test_dispose_clears_buffered_body() {
        let response = ResponseMessage::new(SessionContext::new(), 200);
        response.buffer_body_chunk(BodyChunk::new(Bytes::from_static(b"hello")));
        response.buffer_body_chunk(BodyChunk::empty_last());
        assert_eq!(response.body_chunks().len(), 2);
        response.dispose_buffered_body();
        assert!(response.body_chunks().is_empty());
    }
}
