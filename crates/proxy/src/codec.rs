//! Frame types exchanged with the external HTTP codec.
//!
//! The codec itself (parsing and serializing HTTP/1.x and HTTP/2) is a
//! collaborator outside this crate. It delivers decoded frames inbound and
//! accepts frames outbound; this module defines that boundary plus the
//! [`FrameEncoder`] seam a transport uses to put outbound frames on the
//! wire.

use bytes::{Bytes, BytesMut};

use gatehouse_common::GatehouseResult;

use crate::headers::Headers;

/// Decoded head of an inbound HTTP request.
///
/// A failed decode still produces a head frame, with `decode_error` set,
/// so the receiver can answer 400 instead of hanging up silently. A codec
/// that aggregates small requests may deliver the whole body inline via
/// `aggregated_body`.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    /// Wire version text, e.g. "HTTP/1.1".
    pub version: String,
    /// Method exactly as it appeared on the wire.
    pub method: String,
    /// Request target, path plus optional query.
    pub uri: String,
    pub headers: Headers,
    pub decode_error: Option<String>,
    pub aggregated_body: Option<Bytes>,
}

impl RequestHead {
    /// Whether the connection stays open after this exchange, per the
    /// version default and any `Connection` header.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self.headers.first("connection");
        if self.version.eq_ignore_ascii_case("HTTP/1.0") {
            matches!(connection, Some(v) if v.eq_ignore_ascii_case("keep-alive"))
        } else {
            !matches!(connection, Some(v) if v.eq_ignore_ascii_case("close"))
        }
    }

    /// Whether the client asked for a `100 Continue` before sending its body.
    pub fn expects_100_continue(&self) -> bool {
        matches!(
            self.headers.first("expect"),
            Some(v) if v.eq_ignore_ascii_case("100-continue")
        )
    }
}

/// Head of an outbound HTTP response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(version: impl Into<String>, status: u16) -> Self {
        Self {
            version: version.into(),
            status,
            headers: Headers::new(),
        }
    }

    /// The interim `100 Continue` response.
    pub fn continue_100() -> Self {
        Self::new("HTTP/1.1", 100)
    }
}

/// One piece of message body. `last` marks the final chunk of the message.
///
/// The payload is reference-counted; cloning a chunk retains the bytes and
/// dropping the last handle releases them. Any code path that neither
/// forwards nor writes a chunk must let it drop.
#[derive(Debug, Clone, Default)]
pub struct BodyChunk {
    pub data: Bytes,
    pub last: bool,
}

impl BodyChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            last: false,
        }
    }

    pub fn last(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            last: true,
        }
    }

    /// A zero-length terminator chunk.
    pub fn empty_last() -> Self {
        Self {
            data: Bytes::new(),
            last: true,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Connection facts relayed by a proxy-protocol header, already consumed
/// by the address handler before frames reach this crate.
#[derive(Debug, Clone)]
pub struct ProxyInfo {
    pub source_address: String,
}

/// A framed HTTP message crossing the codec boundary.
#[derive(Debug, Clone)]
pub enum HttpFrame {
    RequestHead(RequestHead),
    ResponseHead(ResponseHead),
    Content(BodyChunk),
    ProxyInfo(ProxyInfo),
}

impl HttpFrame {
    /// Short type tag for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestHead(_) => "request head",
            Self::ResponseHead(_) => "response head",
            Self::Content(_) => "content",
            Self::ProxyInfo(_) => "proxy info",
        }
    }
}

/// Serializes outbound frames into wire bytes.
///
/// Installed into a transport by the host; the proxy core never encodes
/// frames itself.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &HttpFrame, dst: &mut BytesMut) -> GatehouseResult<()>;
}
