//! Inbound response writer.
//!
//! Last gateway stage on a client channel: serializes the single
//! [`ResponseMessage`] the filter pipeline produces for each cycle,
//! enforces at-most-one active outbound response per channel, decides
//! keep-alive versus close, and drives post-response cleanup.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, warn};

use gatehouse_common::{GatehouseError, GatehouseResult};

use crate::channel::attrs;
use crate::codec::{BodyChunk, HttpFrame, ResponseHead};
use crate::passport::{Passport, PassportState};
use crate::pipeline::{
    ChannelHandler, CompleteReason, HandlerContext, LifecycleEvent, PipelineMessage,
};
use crate::request::{has_chunked_transfer_encoding, RequestInfo};
use crate::response::ResponseMessage;
use crate::session::keys;

/// Extension header correlating an HTTP/2 stream across the codec.
pub const X_HTTP2_STREAM_ID: &str = "x-http2-stream-id";

/// Host seam notified when a request/response cycle finishes, for metrics
/// and access logging. Errors are logged and swallowed.
pub trait RequestCompleteHandler: Send + Sync {
    fn handle(&self, inbound: &RequestInfo, response: &ResponseMessage) -> GatehouseResult<()>;
}

/// Host predicate for responses the writer should ignore entirely.
pub type SkipPredicate = dyn Fn(&ResponseMessage) -> bool + Send + Sync;

#[derive(Default)]
struct WriterState {
    is_handling_request: bool,
    started_sending_response: bool,
    close_connection: bool,
    response: Option<Arc<ResponseMessage>>,
}

/// Inbound-side channel stage serializing gateway responses back to the
/// client.
#[derive(Default)]
pub struct ClientResponseWriter {
    complete_handler: Option<Arc<dyn RequestCompleteHandler>>,
    skip: Option<Arc<SkipPredicate>>,
    state: Mutex<WriterState>,
}

impl ClientResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_complete_handler(mut self, handler: Arc<dyn RequestCompleteHandler>) -> Self {
        self.complete_handler = Some(handler);
        self
    }

    /// Install a predicate for responses this writer must not process.
    pub fn with_skip_predicate(mut self, skip: Arc<SkipPredicate>) -> Self {
        self.skip = Some(skip);
        self
    }

    fn skip_processing(&self, response: &ResponseMessage) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(response))
    }

    fn handle_response(&self, ctx: &HandlerContext<'_>, response: Arc<ResponseMessage>) {
        if self.skip_processing(&response) {
            return;
        }

        {
            let mut state = self.state.lock();
            if !state.is_handling_request || state.started_sending_response {
                // Either mid-stream already, or outside an active cycle
                // (an IDLE or read timeout fired). Nothing to salvage:
                // drop both response bodies and close the socket, which
                // drives a complete event for cleanup.
                response.dispose_buffered_body();
                if let Some(existing) = &state.response {
                    existing.dispose_buffered_body();
                }
                drop(state);
                ctx.close();
                return;
            }
            state.started_sending_response = true;
            if matches!(
                response.headers().first("connection"),
                Some(value) if value.eq_ignore_ascii_case("close")
            ) {
                state.close_connection = true;
            }
            state.response = Some(Arc::clone(&response));
        }
        ctx.channel()
            .attrs()
            .set_arc(&attrs::GATE_RESPONSE, Arc::clone(&response));

        if !ctx.channel().is_active() {
            ctx.close();
            return;
        }

        let (wire, keep_alive) = self.build_wire_response(&response);
        if !keep_alive {
            // A non-keep-alive inbound request ends this connection once
            // the response is complete.
            self.state.lock().close_connection = true;
        }
        let _ = ctx.write(PipelineMessage::Frame(HttpFrame::ResponseHead(wire)));

        let mut wrote_last = false;
        for chunk in response.body_chunks() {
            wrote_last |= chunk.last;
            let _ = ctx.write(PipelineMessage::Frame(HttpFrame::Content(chunk)));
        }
        ctx.flush();

        if wrote_last {
            record_last_content(&response);
        }
    }

    fn handle_streamed_content(&self, ctx: &HandlerContext<'_>, chunk: BodyChunk) {
        if !ctx.channel().is_active() {
            drop(chunk);
            ctx.close();
            return;
        }
        let last = chunk.last;
        let _ = ctx.write_and_flush(PipelineMessage::Frame(HttpFrame::Content(chunk)));
        if last {
            if let Some(response) = self.state.lock().response.as_ref() {
                record_last_content(response);
            } else {
                Passport::from_channel(ctx.channel()).add(PassportState::OutRespLastContentSent);
            }
        }
    }

    /// Build the wire response head per HTTP semantics: version pinned to
    /// the inbound protocol for HTTP/1.x (HTTP/1.1 otherwise), headers
    /// copied verbatim, framing header added when absent, keep-alive
    /// decided by the native inbound request. Also reports that keep-alive
    /// decision.
    fn build_wire_response(&self, response: &ResponseMessage) -> (ResponseHead, bool) {
        let inbound_protocol = response
            .inbound_request()
            .map(|info| info.protocol.clone())
            .unwrap_or_default();
        let version = if inbound_protocol.starts_with("HTTP/1") {
            inbound_protocol
        } else {
            // Copes with HTTP/2 inbound.
            "HTTP/1.1".to_string()
        };

        let mut head = ResponseHead::new(version, response.status());
        head.headers = response.headers().clone();

        if head.headers.first("content-length").is_none()
            && !has_chunked_transfer_encoding(&head.headers)
        {
            head.headers.add("Transfer-Encoding", "chunked");
        }

        let native = response.context().store().get(&keys::ENGINE_HTTP_REQUEST);
        let keep_alive = native
            .as_ref()
            .map(|head| head.is_keep_alive())
            .unwrap_or(false);
        if keep_alive {
            set_keep_alive(&mut head);
        } else {
            head.headers.set("Connection", "close");
        }

        if let Some(native) = native {
            if let Some(stream_id) = native.headers.first(X_HTTP2_STREAM_ID) {
                let stream_id = stream_id.to_string();
                head.headers.set(X_HTTP2_STREAM_ID, stream_id);
            }
        }

        (head, keep_alive)
    }

    fn handle_complete(&self, is_handling: bool, response: Option<&ResponseMessage>) {
        let Some(response) = response else {
            return;
        };
        if !is_handling {
            return;
        }
        if let (Some(handler), Some(inbound)) = (&self.complete_handler, response.inbound_request())
        {
            if let Err(err) = handler.handle(inbound, response) {
                error!(error = %err, "error in request complete handler");
            }
        }
    }

    fn handle_error(&self, ctx: &HandlerContext<'_>, error: GatehouseError) {
        let status = error.to_http_status();
        error!(
            channel = %ctx.channel().info(),
            error = %error,
            status,
            "exception in client connection pipeline"
        );

        let write_error_response = {
            let mut state = self.state.lock();
            let can_respond = state.is_handling_request
                && !state.started_sending_response
                && ctx.channel().is_active();
            if can_respond {
                state.started_sending_response = true;
            }
            can_respond
        };

        if write_error_response {
            let mut head = ResponseHead::new("HTTP/1.1", status);
            head.headers.set("Connection", "close");
            let _ = ctx.write(PipelineMessage::Frame(HttpFrame::ResponseHead(head)));
            let _ = ctx.write_and_flush(PipelineMessage::Frame(HttpFrame::Content(
                BodyChunk::empty_last(),
            )));
            Passport::from_channel(ctx.channel()).add(PassportState::OutRespLastContentSent);
        }
        ctx.close();
    }
}

/// Keep-alive marking: HTTP/1.1 responses drop any `Connection` header
/// (persistence is the default); HTTP/1.0 responses state it explicitly.
fn set_keep_alive(head: &mut ResponseHead) {
    if head.version.eq_ignore_ascii_case("HTTP/1.0") {
        head.headers.set("Connection", "keep-alive");
    } else {
        head.headers.remove("connection");
    }
}

fn record_last_content(response: &ResponseMessage) {
    if let Some(passport) = response.context().store().get(&keys::PASSPORT) {
        passport.add(PassportState::OutRespLastContentSent);
    }
}

impl ChannelHandler for ClientResponseWriter {
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) {
        match msg {
            PipelineMessage::Response(response) => self.handle_response(ctx, response),
            PipelineMessage::Frame(HttpFrame::Content(chunk)) => {
                self.handle_streamed_content(ctx, chunk)
            }
            other => {
                let kind = other.kind();
                drop(other);
                self.handle_error(
                    ctx,
                    GatehouseError::internal_fatal(format!(
                        "received invalid message from origin: {kind}"
                    )),
                );
            }
        }
    }

    fn on_event(&self, ctx: &HandlerContext<'_>, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Start => {
                let mut state = self.state.lock();
                state.is_handling_request = true;
                state.started_sending_response = false;
                state.close_connection = false;
                state.response = None;
            }
            LifecycleEvent::Complete(reason) => {
                let (response, is_handling, close_connection) = {
                    let mut state = self.state.lock();
                    (
                        state.response.take(),
                        state.is_handling_request,
                        state.close_connection,
                    )
                };
                if let Some(response) = &response {
                    response.dispose_buffered_body();
                }
                self.handle_complete(is_handling, response.as_deref());

                if reason == CompleteReason::SessionComplete && !close_connection {
                    // Pick up the next pipelined request on this connection.
                    ctx.read();
                } else {
                    if is_handling && reason != CompleteReason::SessionComplete {
                        warn!(
                            reason = ?reason,
                            channel = %ctx.channel().info(),
                            "complete event while still handling the request"
                        );
                    }
                    ctx.close();
                }

                self.state.lock().is_handling_request = false;
            }
            LifecycleEvent::IdleState => {
                debug!(channel = %ctx.channel().id(), "idle state event");
            }
        }
        ctx.forward_event(event);
    }

    fn on_error(&self, ctx: &HandlerContext<'_>, error: GatehouseError) {
        self.handle_error(ctx, error);
    }
}
