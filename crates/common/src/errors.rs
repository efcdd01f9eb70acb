//! Error types for the Gatehouse proxy core.
//!
//! Errors raised inside the proxy core carry an HTTP status hint and a
//! fatality flag. Fatal errors close the client channel after the current
//! write; non-fatal errors propagate to the filter pipeline, which decides
//! whether to turn them into an error response.

use std::fmt;
use thiserror::Error;

/// Boxed error cause, kept as a source for diagnostics.
pub type ErrorCause = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for proxy core operations.
#[derive(Error, Debug)]
pub enum GatehouseError {
    /// The HTTP codec failed to decode an inbound request.
    #[error("invalid http request: {message}")]
    Decode {
        message: String,
        cause: Option<String>,
    },

    /// The per-origin connection ceiling was hit before a connect was attempted.
    #[error("max connections per host exceeded: limit={limit}, open_and_opening={open}")]
    MaxConnectionsPerHost { limit: i32, open: i64 },

    /// Establishing a TCP connection to an origin failed.
    #[error("origin connect failed: {message}")]
    Connect {
        message: String,
        #[source]
        source: Option<ErrorCause>,
    },

    /// No bytes arrived on the channel within the idle window.
    #[error("read timeout after {duration_ms}ms")]
    ReadTimeout { duration_ms: u64 },

    /// Writing part of the response to the client failed.
    #[error("error writing {stage} to client")]
    Write {
        stage: WriteStage,
        #[source]
        source: Option<ErrorCause>,
    },

    /// Anything that should never happen.
    #[error("internal error: {message}")]
    Internal { message: String, fatal: bool },
}

/// Result type alias for proxy core operations.
pub type GatehouseResult<T> = Result<T, GatehouseError>;

/// Which part of the client response a write failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    ResponseHeaders,
    ResponseContent,
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResponseHeaders => write!(f, "response headers"),
            Self::ResponseContent => write!(f, "response content"),
        }
    }
}

/// Outbound error classification surfaced to the filter pipeline for
/// acquire failures. The pool never converts these into responses itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundErrorKind {
    OriginServerMaxConns,
    ConnectError,
}

impl GatehouseError {
    /// The HTTP status this error maps to when it reaches the client.
    pub fn to_http_status(&self) -> u16 {
        match self {
            Self::Decode { .. } => 400,
            Self::MaxConnectionsPerHost { .. } => 503,
            Self::Connect { .. } => 503,
            Self::ReadTimeout { .. } => 504,
            Self::Write { .. } => 500,
            Self::Internal { .. } => 500,
        }
    }

    /// Fatal errors close the channel after the current write completes.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Decode { .. } => true,
            Self::Write { .. } => true,
            Self::Internal { fatal, .. } => *fatal,
            _ => false,
        }
    }

    /// Outbound classification for acquire failures, if this is one.
    pub fn outbound_kind(&self) -> Option<OutboundErrorKind> {
        match self {
            Self::MaxConnectionsPerHost { .. } => Some(OutboundErrorKind::OriginServerMaxConns),
            Self::Connect { .. } => Some(OutboundErrorKind::ConnectError),
            _ => None,
        }
    }

    /// Create a decode error (400 to the client).
    pub fn decode(message: impl Into<String>, cause: Option<String>) -> Self {
        Self::Decode {
            message: message.into(),
            cause,
        }
    }

    /// Create a max-connections-per-host error.
    pub fn max_connections(limit: i32, open: i64) -> Self {
        Self::MaxConnectionsPerHost { limit, open }
    }

    /// Create a connect error wrapping the underlying cause.
    pub fn connect(message: impl Into<String>, source: Option<ErrorCause>) -> Self {
        Self::Connect {
            message: message.into(),
            source,
        }
    }

    /// Create a read timeout error.
    pub fn read_timeout(duration_ms: u64) -> Self {
        Self::ReadTimeout { duration_ms }
    }

    /// Create a write error for the given response stage.
    pub fn write_failure(stage: WriteStage, source: Option<ErrorCause>) -> Self {
        Self::Write { stage, source }
    }

    /// Create a non-fatal internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            fatal: false,
        }
    }

    /// Create a fatal internal error. The channel closes after the current write.
    pub fn internal_fatal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            fatal: true,
        }
    }
}

impl From<std::io::Error> for GatehouseError {
    fn from(err: std::io::Error) -> Self {
        Self::Connect {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
