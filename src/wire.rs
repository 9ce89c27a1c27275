//! Wire message tags and the protobuf bodies they carry.
//!
//! Every datagram leads with one byte. Bit 7 set marks a data packet; any
//! other value is one of the message tags below, followed by a
//! protobuf-encoded body in either the plain or the padded envelope (see
//! `packet`).

/// Client asks the listener for a cookie. Always padded.
pub(crate) const MSG_CHALLENGE_REQUEST: u8 = 32;
/// Listener's stateless cookie reply
pub(crate) const MSG_CHALLENGE_REPLY: u8 = 33;
/// Client returns the cookie along with its cert and crypt material
pub(crate) const MSG_CONNECT_REQUEST: u8 = 34;
/// Server completes the handshake
pub(crate) const MSG_CONNECT_OK: u8 = 35;
/// Deliberate teardown, retransmitted until acked. Always padded.
pub(crate) const MSG_CONNECTION_CLOSED: u8 = 36;
/// "I have no such session" ack
pub(crate) const MSG_NO_CONNECTION: u8 = 37;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChallengeRequest {
    /// Connection ID the initiator chose for its side of the session
    #[prost(fixed32, tag = "1")]
    pub connection_id: u32,
    /// Initiator's local clock, echoed back for a ping estimate
    #[prost(uint64, optional, tag = "2")]
    pub my_timestamp: Option<u64>,
    #[prost(uint32, tag = "3")]
    pub protocol_version: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChallengeReply {
    /// Echo of the initiator's connection ID
    #[prost(fixed32, tag = "1")]
    pub connection_id: u32,
    /// The cookie: keyed MAC over (time bucket, source address)
    #[prost(fixed64, tag = "2")]
    pub challenge: u64,
    /// Echo of the initiator's `my_timestamp`
    #[prost(uint64, optional, tag = "3")]
    pub your_timestamp: Option<u64>,
    #[prost(uint32, tag = "4")]
    pub protocol_version: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    #[prost(fixed32, tag = "1")]
    pub client_connection_id: u32,
    /// Cookie from the ChallengeReply, returned verbatim
    #[prost(fixed64, tag = "2")]
    pub challenge: u64,
    #[prost(uint64, optional, tag = "3")]
    pub my_timestamp: Option<u64>,
    /// Smoothed ping estimate, if the client already has one
    #[prost(uint32, optional, tag = "4")]
    pub ping_est_ms: Option<u32>,
    /// Signed certificate; may assert the client's identity
    #[prost(bytes = "vec", optional, tag = "5")]
    pub cert: Option<Vec<u8>>,
    /// Signed session crypt info
    #[prost(bytes = "vec", optional, tag = "6")]
    pub crypt: Option<Vec<u8>>,
    /// Identity in canonical string form, when the cert doesn't assert one
    #[prost(string, optional, tag = "7")]
    pub identity_string: Option<String>,
    #[prost(uint32, tag = "8")]
    pub protocol_version: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectOk {
    /// Echo of the client's connection ID
    #[prost(fixed32, tag = "1")]
    pub client_connection_id: u32,
    /// The server's own connection ID for this session
    #[prost(fixed32, tag = "2")]
    pub server_connection_id: u32,
    /// Echo of the client's ConnectRequest timestamp
    #[prost(uint64, optional, tag = "3")]
    pub your_timestamp: Option<u64>,
    /// How long the timestamp sat on the server before this reply was sent
    #[prost(uint64, optional, tag = "4")]
    pub delay_time_usec: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub cert: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub crypt: Option<Vec<u8>>,
    #[prost(string, optional, tag = "7")]
    pub identity_string: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionClosed {
    /// Recipient's connection ID, zero if unknown
    #[prost(fixed32, tag = "1")]
    pub to_connection_id: u32,
    /// Sender's connection ID, zero if it never had one
    #[prost(fixed32, tag = "2")]
    pub from_connection_id: u32,
    #[prost(uint32, tag = "3")]
    pub reason_code: u32,
    #[prost(string, tag = "4")]
    pub debug: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NoConnection {
    #[prost(fixed32, tag = "1")]
    pub to_connection_id: u32,
    #[prost(fixed32, tag = "2")]
    pub from_connection_id: u32,
}

/// Stats/ack payload piggybacked onto data packets.
///
/// `seq_num` is never sent; the receiver stamps the wire sequence of the
/// carrying data packet onto the parsed message for ack bookkeeping.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Stats {
    #[prost(message, optional, tag = "1")]
    pub stats: Option<QualityStats>,
    /// `ACK_REQUEST_*` bits
    #[prost(uint32, tag = "2")]
    pub flags: u32,
    /// Highest wire sequence received from the peer, as an ack
    #[prost(uint32, optional, tag = "3")]
    pub ack_seq: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub seq_num: Option<u32>,
}

impl Stats {
    /// Peer should schedule an end-to-end ack for this packet
    pub const ACK_REQUEST_E2E: u32 = 1;
    /// Peer should ack as soon as it processes this packet
    pub const ACK_REQUEST_IMMEDIATE: u32 = 2;

    /// Flags implied by the message contents, independent of what the caller
    /// has requested: sending stats always demands an ack.
    pub(crate) fn implied_flags(&self) -> u32 {
        if self.stats.is_some() {
            Self::ACK_REQUEST_E2E
        } else {
            0
        }
    }

    /// Whether serializing this message would accomplish anything
    pub(crate) fn is_empty(&self) -> bool {
        self.stats.is_none() && self.flags == 0 && self.ack_seq.is_none()
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QualityStats {
    #[prost(message, optional, tag = "1")]
    pub lifetime: Option<LifetimeStats>,
    #[prost(message, optional, tag = "2")]
    pub instantaneous: Option<InstantaneousStats>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LifetimeStats {
    #[prost(uint64, tag = "1")]
    pub packets_sent: u64,
    #[prost(uint64, tag = "2")]
    pub bytes_sent: u64,
    #[prost(uint64, tag = "3")]
    pub packets_recv: u64,
    #[prost(uint64, tag = "4")]
    pub bytes_recv: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstantaneousStats {
    #[prost(uint32, optional, tag = "1")]
    pub ping_ms: Option<u32>,
    /// Outgoing packet rate, fixed-point x10
    #[prost(uint32, tag = "2")]
    pub packets_out_per_sec_x10: u32,
    /// Incoming packet rate, fixed-point x10
    #[prost(uint32, tag = "3")]
    pub packets_in_per_sec_x10: u32,
}
