use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;
use rand::Rng;

use crate::rate_limit::ReplyLimiter;
use crate::{Microseconds, MAX_RECENT_LOCAL_IDS};

/// An outgoing datagram, ready for the embedder to hand to its socket
#[derive(Debug, Clone)]
pub struct Transmit {
    /// The address the datagram should be sent to
    pub destination: SocketAddr,
    /// Complete wire contents of the datagram
    pub contents: Bytes,
}

/// Session identifier chosen locally and independently by each side.
///
/// Packets carry the *recipient's* ID so that multiple sessions can share one
/// address. An ID whose low 16 bits are zero is not valid on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Generate an ID acceptable to a remote peer
    pub(crate) fn random<R: Rng>(rng: &mut R) -> Self {
        loop {
            let id = rng.gen::<u32>();
            if id & 0xffff != 0 {
                return Self(id);
            }
        }
    }

    /// Whether a peer-supplied ID is usable at all
    pub fn is_wire_valid(self) -> bool {
        self.0 & 0xffff != 0
    }

    pub(crate) fn low_word(self) -> u16 {
        self.0 as u16
    }

    pub fn to_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for ConnectionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Process-level state shared by every listener and connection.
///
/// Held behind an `Arc` so tests can give each fixture its own instance
/// instead of fighting over true globals.
pub struct TransportContext {
    /// Limits "ignored bad packet" log lines
    bad_packet_log: ReplyLimiter,
    /// Limits unsolicited `NoConnection` replies to unverified sources
    spam_reply: ReplyLimiter,
    /// Low words of recently used local connection IDs, oldest first
    recent_local_ids: Mutex<VecDeque<u16>>,
}

impl TransportContext {
    /// One diagnostic event per two seconds, per the wire-abuse budget
    const DIAGNOSTIC_INTERVAL: Microseconds = 2_000_000;

    pub fn new() -> Self {
        Self {
            bad_packet_log: ReplyLimiter::new(Self::DIAGNOSTIC_INTERVAL),
            spam_reply: ReplyLimiter::new(Self::DIAGNOSTIC_INTERVAL),
            recent_local_ids: Mutex::new(VecDeque::with_capacity(MAX_RECENT_LOCAL_IDS)),
        }
    }

    /// Whether a bad-packet log line may be emitted at `now`
    pub(crate) fn may_report_bad_packet(&self, now: Microseconds) -> bool {
        self.bad_packet_log.allow(now)
    }

    /// Whether an unsolicited reply may be sent to an unverified source at `now`
    pub(crate) fn may_send_spam_reply(&self, now: Microseconds) -> bool {
        self.spam_reply.allow(now)
    }

    pub(crate) fn remember_local_id(&self, id: ConnectionId) {
        let mut ids = self.recent_local_ids.lock().unwrap();
        if ids.len() == MAX_RECENT_LOCAL_IDS {
            ids.pop_front();
        }
        ids.push_back(id.low_word());
    }

    /// Whether `id` plausibly belonged to a recently-destroyed local connection
    pub(crate) fn is_recent_local_id(&self, id: ConnectionId) -> bool {
        self.recent_local_ids
            .lock()
            .unwrap()
            .contains(&id.low_word())
    }
}

impl Default for TransportContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit a rate-limited log line about a packet we are dropping
macro_rules! report_bad_packet {
    ($ctx:expr, $now:expr, $($arg:tt)*) => {
        if $ctx.may_report_bad_packet($now) {
            ::tracing::debug!($($arg)*);
        }
    };
}
pub(crate) use report_bad_packet;
