//! Per-channel lifecycle trace.
//!
//! The passport is an append-only log of `(state, timestamp)` pairs attached
//! to a channel. It answers "did this channel ever reach state X, and when"
//! for diagnostics and for the cancellation bookkeeping in the request
//! receiver.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::channel::{attrs, Channel};

/// Lifecycle states recorded by the proxy core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassportState {
    OriginChConnecting,
    OriginChConnected,
    OriginChPoolReturned,
    InReqCancelled,
    OutRespLastContentSent,
}

impl fmt::Display for PassportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OriginChConnecting => "ORIGIN_CH_CONNECTING",
            Self::OriginChConnected => "ORIGIN_CH_CONNECTED",
            Self::OriginChPoolReturned => "ORIGIN_CH_POOL_RETURNED",
            Self::InReqCancelled => "IN_REQ_CANCELLED",
            Self::OutRespLastContentSent => "OUT_RESP_LAST_CONTENT_SENT",
        };
        write!(f, "{name}")
    }
}

/// Append-only per-channel trace of lifecycle state transitions.
///
/// Cheap to clone; all clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct Passport {
    states: Arc<Mutex<Vec<(PassportState, Instant)>>>,
}

impl Passport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a state transition now.
    pub fn add(&self, state: PassportState) {
        self.states.lock().push((state, Instant::now()));
    }

    /// Timestamp of the first occurrence of `state`, if any.
    pub fn find_state(&self, state: PassportState) -> Option<Instant> {
        self.states
            .lock()
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, at)| *at)
    }

    /// Snapshot of the recorded states, in order.
    pub fn states(&self) -> Vec<PassportState> {
        self.states.lock().iter().map(|(s, _)| *s).collect()
    }

    /// Attach this passport to a channel under the well-known attribute.
    pub fn attach_to_channel(&self, channel: &Channel) {
        channel.attrs().set(&attrs::PASSPORT, self.clone());
    }

    /// The passport attached to a channel. A channel without one gets a
    /// fresh passport attached here, so states recorded on the returned
    /// handle are kept with the channel rather than lost.
    pub fn from_channel(channel: &Channel) -> Passport {
        if let Some(passport) = channel.attrs().get(&attrs::PASSPORT) {
            return (*passport).clone();
        }
        let passport = Passport::new();
        passport.attach_to_channel(channel);
        passport
    }
}

impl fmt::Display for Passport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "passport[")?;
        for (i, (state, _)) in self.states.lock().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{state}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_state_returns_first_occurrence() {
        let passport = Passport::new();
        passport.add(PassportState::OriginChConnecting);
        passport.add(PassportState::OriginChConnected);
        passport.add(PassportState::OriginChPoolReturned);
        passport.add(PassportState::OriginChPoolReturned);

        let first = passport.find_state(PassportState::OriginChPoolReturned).unwrap();
        let states = passport.states();
        assert_eq!(states.len(), 4);
        // The first pool-return precedes the second; find_state must report it.
        assert!(first <= Instant::now());
        assert_eq!(
            states,
            vec![
                PassportState::OriginChConnecting,
                PassportState::OriginChConnected,
                PassportState::OriginChPoolReturned,
                PassportState::OriginChPoolReturned,
            ]
        );
    }

    #[test]
    fn test_absent_state_is_none() {
        let passport = Passport::new();
        assert!(passport.find_state(PassportState::InReqCancelled).is_none());
    }

    #[test]
    fn test_clones_share_the_log() {
        let passport = Passport::new();
        let other = passport.clone();
        other.add(PassportState::OriginChConnecting);
        assert!(passport.find_state(PassportState::OriginChConnecting).is_some());
    }

    struct NullTransport;

    impl crate::channel::Transport for NullTransport {
        fn event_loop(&self) -> crate::channel::EventLoopId {
            crate::channel::EventLoopId(0)
        }
        fn is_open(&self) -> bool {
            true
        }
        fn is_active(&self) -> bool {
            true
        }
        fn write(
            &self,
            _frame: crate::codec::HttpFrame,
        ) -> gatehouse_common::GatehouseResult<()> {
            Ok(())
        }
        fn flush(&self) {}
        fn request_read(&self) {}
        fn close(&self) {}
        fn local_addr(&self) -> Option<std::net::SocketAddr> {
            None
        }
        fn peer_addr(&self) -> Option<std::net::SocketAddr> {
            None
        }
    }

    #[test]
    fn test_from_channel_attaches_a_fresh_passport() {
        let channel = Channel::new(Box::new(NullTransport));

        let passport = Passport::from_channel(&channel);
        passport.add(PassportState::OriginChPoolReturned);

        // States recorded on the returned handle stay with the channel.
        let again = Passport::from_channel(&channel);
        assert!(again
            .find_state(PassportState::OriginChPoolReturned)
            .is_some());
    }
}
