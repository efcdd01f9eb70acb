//! Inbound request receiver.
//!
//! First gateway stage on a client channel: turns decoded request frames
//! into a [`RequestMessage`], answers `Expect: 100-continue`, fires the
//! request into the filter pipeline, and suppresses laggard body chunks
//! that arrive after the request was cancelled. On the outbound path it
//! watches response writes and raises write failures upward.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use gatehouse_common::{GatehouseError, GatehouseResult, WriteStage};

use crate::channel::{attrs, Channel};
use crate::codec::{BodyChunk, HttpFrame, RequestHead, ResponseHead};
use crate::passport::{Passport, PassportState};
use crate::pipeline::{
    ChannelHandler, CompleteReason, HandlerContext, LifecycleEvent, PipelineMessage,
};
use crate::request::{
    has_chunked_transfer_encoding, has_nonzero_content_length, RequestMessage, SCHEME_HTTP,
    SCHEME_HTTPS,
};
use crate::response::ResponseMessage;
use crate::session::{keys, SessionContext, SessionDecorator};

#[derive(Default)]
struct ReceiverState {
    client_request: Option<RequestHead>,
    gate_request: Option<Arc<RequestMessage>>,
}

/// Inbound-side channel stage translating framed HTTP into gateway
/// request messages.
#[derive(Default)]
pub struct ClientRequestReceiver {
    decorator: Option<Arc<dyn SessionDecorator>>,
    state: Mutex<ReceiverState>,
}

impl ClientRequestReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decorator(decorator: Arc<dyn SessionDecorator>) -> Self {
        Self {
            decorator: Some(decorator),
            state: Mutex::new(ReceiverState::default()),
        }
    }

    /// The in-flight request stored on a channel, if any.
    pub fn request_from_channel(channel: &Channel) -> Option<Arc<RequestMessage>> {
        channel.attrs().get(&attrs::GATE_REQUEST)
    }

    /// The in-flight response stored on a channel, if any.
    pub fn response_from_channel(channel: &Channel) -> Option<Arc<ResponseMessage>> {
        channel.attrs().get(&attrs::GATE_RESPONSE)
    }

    fn handle_request_head(&self, ctx: &HandlerContext<'_>, mut head: RequestHead) {
        // Don't process requests the codec could not decode.
        if let Some(cause) = head.decode_error.take() {
            let message = format!(
                "invalid http request: uri={}, channel={}",
                head.uri,
                ctx.channel().info()
            );
            self.state.lock().client_request = None;
            ctx.forward_error(GatehouseError::decode(message, Some(cause)));
            return;
        }

        let request = Arc::new(self.build_request(ctx.channel(), &head));
        self.handle_expect_100_continue(ctx, &mut head, &request);

        // Keep the native request for response construction, and publish
        // the gateway request on the channel.
        request
            .context()
            .store()
            .set(&keys::ENGINE_HTTP_REQUEST, head.clone());
        ctx.channel()
            .attrs()
            .set_arc(&attrs::GATE_REQUEST, Arc::clone(&request));

        {
            let mut state = self.state.lock();
            state.client_request = Some(head);
            state.gate_request = Some(Arc::clone(&request));
        }

        ctx.forward_read(PipelineMessage::Request(request));
    }

    fn handle_expect_100_continue(
        &self,
        ctx: &HandlerContext<'_>,
        head: &mut RequestHead,
        request: &RequestMessage,
    ) {
        if !head.expects_100_continue() {
            return;
        }
        let interim = PipelineMessage::Frame(HttpFrame::ResponseHead(ResponseHead::continue_100()));
        if let Err(cause) = ctx.write_and_flush(interim) {
            ctx.forward_error(GatehouseError::internal_fatal(format!(
                "failed while writing 100-continue response: {cause}"
            )));
        }
        // The expectation was answered here; don't proxy it downstream.
        head.headers.remove("expect");
        request.headers().remove("expect");
    }

    /// Build the gateway request from the native head and the channel
    /// attributes placed by the lower address and TLS handlers.
    fn build_request(&self, channel: &Channel, head: &RequestHead) -> RequestMessage {
        let context = match &self.decorator {
            Some(decorator) => {
                let fresh = SessionContext::new();
                fresh.store().set(&keys::ENGINE_CHANNEL, channel.clone());
                decorator.decorate(fresh)
            }
            None => SessionContext::new(),
        };

        let client_ip = channel
            .attrs()
            .get(&attrs::SOURCE_ADDRESS)
            .map(|ip| (*ip).clone())
            .or_else(|| channel.peer_addr().map(|a| a.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        let port = channel
            .attrs()
            .get(&attrs::LOCAL_PORT)
            .map(|p| *p)
            .or_else(|| channel.local_addr().map(|a| a.port()))
            .unwrap_or(0);
        let server_name = channel
            .attrs()
            .get(&attrs::LOCAL_ADDRESS)
            .map(|name| (*name).clone())
            .or_else(|| channel.local_addr().map(|a| a.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        let mut scheme = SCHEME_HTTP;
        if let Some(tls_info) = channel.attrs().get(&attrs::TLS_INFO) {
            context
                .store()
                .set(&keys::TLS_HANDSHAKE_INFO, (*tls_info).clone());
            scheme = SCHEME_HTTPS;
        }

        // An ALPN-derived protocol name wins over the wire version text.
        let protocol = channel
            .attrs()
            .get(&attrs::PROTOCOL_NAME)
            .map(|p| (*p).clone())
            .unwrap_or_else(|| head.version.clone());

        let (path, query) = match head.uri.find('?') {
            Some(index) => (&head.uri[..index], Some(&head.uri[index + 1..])),
            None => (head.uri.as_str(), None),
        };

        let request = RequestMessage::new(
            context.clone(),
            protocol,
            head.method.to_ascii_lowercase(),
            path,
            crate::headers::QueryParams::parse(query),
            head.headers.clone(),
            client_ip,
            scheme,
            port,
            server_name,
        );

        // Decide body presence from the headers; no content has arrived yet.
        if has_chunked_transfer_encoding(&request.headers())
            || has_nonzero_content_length(&request.headers())
        {
            request.set_has_body(true);
        }

        request.store_inbound_request();

        let passport = Passport::from_channel(channel);
        context.store().set(&keys::PASSPORT, passport);

        // A full-request frame carries its whole body inline.
        if let Some(body) = head.aggregated_body.clone() {
            request.buffer_body_chunk(BodyChunk::last(body));
        }

        request
    }

    fn handle_complete(&self, ctx: &HandlerContext<'_>, reason: CompleteReason) {
        let (client_request, gate_request) = {
            let mut state = self.state.lock();
            (state.client_request.take(), state.gate_request.take())
        };

        if let Some(request) = &gate_request {
            request.context().cancel();
            request.dispose_buffered_body();
            if let Some(passport) = request.context().store().get(&keys::PASSPORT) {
                // Only mark the cancel when the response never finished.
                if passport
                    .find_state(PassportState::OutRespLastContentSent)
                    .is_none()
                {
                    passport.add(PassportState::InReqCancelled);
                }
            }
        }

        if reason != CompleteReason::SessionComplete {
            if let (Some(request), Some(head)) = (&gate_request, &client_request) {
                warn!(
                    method = %head.method,
                    uuid = %request.context().uuid(),
                    uri = %head.uri,
                    reason = ?reason,
                    channel = %ctx.channel().info(),
                    "client request completed abnormally"
                );
                if request.context().debug_request() {
                    debug!(endpoint = ?request.context().endpoint(), "endpoint");
                    for line in request.context().request_debug() {
                        debug!("{line}");
                    }
                    for line in request.context().routing_debug() {
                        debug!("{line}");
                    }
                }
            }
        }
    }

    fn write_with_error_stage(
        &self,
        ctx: &HandlerContext<'_>,
        frame: HttpFrame,
        stage: WriteStage,
    ) -> GatehouseResult<()> {
        match ctx.write(PipelineMessage::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(cause) => {
                error!(
                    stage = %stage,
                    channel = %ctx.channel().info(),
                    error = %cause,
                    "error writing to client"
                );
                ctx.forward_error(GatehouseError::write_failure(stage, Some(Box::new(cause))));
                Err(GatehouseError::write_failure(stage, None))
            }
        }
    }
}

impl ChannelHandler for ClientRequestReceiver {
    fn on_read(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) {
        match msg {
            PipelineMessage::Frame(HttpFrame::RequestHead(head)) => {
                self.handle_request_head(ctx, head);
            }
            PipelineMessage::Frame(HttpFrame::Content(chunk)) => {
                let forward = {
                    let state = self.state.lock();
                    matches!(&state.gate_request, Some(req) if !req.context().is_cancelled())
                };
                if forward {
                    ctx.forward_read(PipelineMessage::Frame(HttpFrame::Content(chunk)));
                } else {
                    // Laggard chunk for an already-answered request.
                    trace!(
                        channel = %ctx.channel().id(),
                        bytes = chunk.len(),
                        "dropping laggard body chunk"
                    );
                }
            }
            PipelineMessage::Frame(HttpFrame::ProxyInfo(info)) => {
                // Already consumed by the proxy-protocol handler below us.
                debug!(source = %info.source_address, "proxy protocol info frame");
            }
            other => {
                let kind = other.kind();
                drop(other);
                ctx.forward_error(GatehouseError::internal_fatal(format!(
                    "invalid message type read from client: {kind}"
                )));
            }
        }
    }

    fn on_write(&self, ctx: &HandlerContext<'_>, msg: PipelineMessage) -> GatehouseResult<()> {
        match msg {
            PipelineMessage::Frame(frame @ HttpFrame::ResponseHead(_)) => {
                self.write_with_error_stage(ctx, frame, WriteStage::ResponseHeaders)
            }
            PipelineMessage::Frame(frame @ HttpFrame::Content(_)) => {
                self.write_with_error_stage(ctx, frame, WriteStage::ResponseContent)
            }
            other => {
                let kind = other.kind();
                drop(other);
                let message = format!("attempt to write invalid content type to client: {kind}");
                ctx.forward_error(GatehouseError::internal_fatal(message.clone()));
                Err(GatehouseError::internal_fatal(message))
            }
        }
    }

    fn on_event(&self, ctx: &HandlerContext<'_>, event: LifecycleEvent) {
        if let LifecycleEvent::Complete(reason) = event {
            self.handle_complete(ctx, reason);
            ctx.forward_event(event);
            // After downstream handlers ran their completion logic, the
            // per-request channel attributes are stale.
            ctx.channel().attrs().remove(&attrs::GATE_REQUEST);
            ctx.channel().attrs().remove(&attrs::GATE_RESPONSE);
            return;
        }
        ctx.forward_event(event);
    }
}
