//! # Session Boundary
//!
//! What the stream factory needs from a per-endpoint session. The factory
//! never looks inside a session: it feeds datagrams in, pulls encoded
//! datagrams out, and asks for the state when deciding whether to route or
//! reap.
//!
//! Sessions are shared as `Arc<dyn Session>` between the reader task, the
//! writer task and consumers, so every method takes `&self` and
//! implementations keep their state behind a lock.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::packet::{AppMessage, ApplicationPacket};
use crate::error::Result;

/// Protocol generation of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFamily {
    Current,
    Legacy,
}

impl StreamFamily {
    /// Classifies the first datagram from an unseen endpoint.
    pub fn classify(datagram: &[u8]) -> Self {
        use crate::core::opcodes::OP_SESSION_REQUEST;
        match datagram.get(1) {
            Some(&op) if op as u16 == OP_SESSION_REQUEST => StreamFamily::Current,
            _ => StreamFamily::Legacy,
        }
    }
}

impl fmt::Display for StreamFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamFamily::Current => "current",
            StreamFamily::Legacy => "legacy",
        })
    }
}

/// Lifecycle of a session as seen by the factory. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Established,
    Closing,
    Closed,
}

/// One endpoint's conversation.
pub trait Session: Send + Sync + 'static {
    fn family(&self) -> StreamFamily;

    fn peer(&self) -> SocketAddr;

    /// Feeds one raw datagram from the peer.
    #[doc(alias = "ParseInbound")]
    fn process(&self, datagram: &[u8]) -> Result<()>;

    /// Queues an application message for the peer.
    #[doc(alias = "QueueOutboundPacket")]
    fn queue_packet(&self, packet: &ApplicationPacket, ack_required: bool) -> Result<()>;

    /// Next complete inbound application message, if any.
    #[doc(alias = "PopOutboundPacket")]
    fn pop_packet(&self) -> Option<AppMessage>;

    /// True when `drain_outbound` would return datagrams.
    fn has_pending_output(&self) -> bool;

    /// Encoded datagrams ready for the socket, in send order.
    ///
    /// Only the factory's writer calls this, so writes for one session are
    /// serialized.
    #[doc(alias = "WriteTo")]
    fn drain_outbound(&self) -> Vec<Vec<u8>>;

    /// Advances the lifecycle when the peer has been silent longer than `idle`.
    fn check_timeout(&self, now: Instant, idle: Duration);

    fn state(&self) -> SessionState;

    /// Ages the byte-rate counter.
    fn decay(&self);

    /// Starts an orderly close.
    fn close(&self);

    /// Records traffic from the peer.
    fn touch(&self, now: Instant);

    fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }
}

/// Creates sessions for endpoints the factory has not seen before.
pub trait SessionBuilder: Send + Sync + 'static {
    /// `local` is the factory's bound address, used for diagnostics.
    fn build(&self, family: StreamFamily, peer: SocketAddr, local: SocketAddr)
        -> Arc<dyn Session>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_session_request() {
        assert_eq!(
            StreamFamily::classify(&[0x00, 0x01, 0, 0]),
            StreamFamily::Current
        );
    }

    #[test]
    fn test_classify_defaults_to_legacy() {
        assert_eq!(StreamFamily::classify(&[0x00, 0x09]), StreamFamily::Legacy);
        assert_eq!(StreamFamily::classify(&[0x02, 0x04]), StreamFamily::Legacy);
        assert_eq!(StreamFamily::classify(&[0x01]), StreamFamily::Legacy);
    }
}
