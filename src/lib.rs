//! Sans-I/O state machine for a reliable, encrypted, connection-oriented
//! datagram protocol carried over UDP.
//!
//! This crate contains no networking code. A [`Listener`] consumes unsolicited
//! datagrams via [`Listener::handle`] and answers a stateless cookie handshake;
//! a [`Connection`] owns one session's handshake progress, inbound dispatch,
//! and the framing of encrypted data packets. Both emit outgoing datagrams
//! through `poll_transmit()` and surface their next deadline through
//! `poll_timeout()`, leaving sockets and timers to the embedding event loop.
//!
//! Fragmentation, retransmission, certificate verification, and AEAD itself
//! live behind the seams in [`crypto`] and [`segment`]; this layer moves
//! opaque encrypted chunks and the handshake/teardown control messages that
//! surround them.

mod challenge;
mod packet;
mod rate_limit;

mod shared;
pub use crate::shared::{ConnectionId, TransportContext, Transmit};

mod identity;
pub use crate::identity::{Identity, IdentityParseError};

mod config;
pub use crate::config::{ClientConfig, ConfigError, ConnectionConfig, ListenerConfig};

pub mod wire;

pub mod crypto;

pub mod segment;

mod stats;
pub use crate::stats::{EndToEndStats, ReplyRequest};

mod connection;
pub use crate::connection::{
    ConnectError, Connection, EndReason, Event, SendError, State,
};

mod listener;
pub use crate::listener::{ConnectionHandle, Listener, ListenerEvent};

mod loopback;
pub use crate::loopback::{new_loopback_pair, LoopbackError};

#[cfg(test)]
mod tests;

/// Monotonic local timestamps and wire timestamp echoes, in microseconds.
///
/// Signed so that freshness checks can observe a negative elapsed time when a
/// peer echoes garbage.
pub type Microseconds = i64;

/// The protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// The oldest peer protocol version we are willing to talk to
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Whether an endpoint initiated a connection or accepted it
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl std::ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

//
// Useful internal constants
//

/// Control messages that could be used for reflection amplification are grown
/// to at least this size, and inbound ones below it are rejected.
pub(crate) const MIN_PADDED_PACKET_SIZE: usize = 512;

/// Largest datagram we will ever hand to the embedder for sending
pub(crate) const MAX_UDP_PAYLOAD: usize = 1300;

/// Datagrams shorter than this cannot be any message we know and are dropped
/// before classification.
pub(crate) const MIN_PACKET_SIZE: usize = 5;

/// How many recently-retired local connection IDs we remember in order to
/// quietly ignore late packets for them
pub(crate) const MAX_RECENT_LOCAL_IDS: usize = 256;
