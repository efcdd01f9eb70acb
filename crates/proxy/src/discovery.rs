//! Origin server identity.
//!
//! A [`Server`] names one origin endpoint. It is either configured
//! statically or produced by a service-discovery source (which runs
//! outside this crate); both variants expose `host()`/`port()` uniformly
//! and the variant tag tells consumers which kind they hold.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One origin endpoint. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Server {
    /// A statically configured endpoint.
    Static { host: String, port: u16 },
    /// An endpoint yielded by service discovery.
    Discovered {
        host: String,
        port: u16,
        instance_id: String,
        zone: Option<String>,
    },
}

impl Server {
    pub fn static_endpoint(host: impl Into<String>, port: u16) -> Self {
        Self::Static {
            host: host.into(),
            port,
        }
    }

    pub fn discovered(
        host: impl Into<String>,
        port: u16,
        instance_id: impl Into<String>,
        zone: Option<String>,
    ) -> Self {
        Self::Discovered {
            host: host.into(),
            port,
            instance_id: instance_id.into(),
            zone,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Static { host, .. } => host,
            Self::Discovered { host, .. } => host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Static { port, .. } => *port,
            Self::Discovered { port, .. } => *port,
        }
    }

    pub fn is_discovered(&self) -> bool {
        matches!(self, Self::Discovered { .. })
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port())
    }
}
