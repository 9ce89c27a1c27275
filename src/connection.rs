//! Per-connection protocol state: handshake progress, inbound dispatch by
//! state, the data-packet engine, and teardown.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::crypto::{CryptoProvider, Session};
use crate::loopback::{LoopbackIo, LoopbackItem};
use crate::packet::{
    self, DataHeader, DATA_HEADER_SIZE, DATA_PACKET_BIT, FLAG_PROTOBUF_BLOB,
};
use crate::segment::SegmentLayer;
use crate::shared::report_bad_packet;
use crate::stats::{EndToEndStats, ReplyRequest, SendContext, StatsNeed};
use crate::wire::{self, Stats};
use crate::{
    ClientConfig, ConfigError, ConnectionConfig, ConnectionId, Identity, Microseconds, Side,
    Transmit, TransportContext, MIN_PACKET_SIZE, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};

/// Timestamp echoes older than this are assumed bogus and yield no ping sample
const TIMESTAMP_ECHO_WINDOW: Microseconds = 2_000_000;
/// How long a stored handshake timestamp stays usable for the ConnectOK echo
const HANDSHAKE_TIMESTAMP_WINDOW: Microseconds = 4_000_000;

/// Connection lifecycle states
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// Handshake in progress: a client retrying its requests, or a server
    /// waiting for the application to accept
    Connecting,
    /// Fully established; data flows
    Connected,
    /// Half-closed locally: finishing sends, ignoring inbound data
    Linger,
    /// The peer told us the connection is over
    ClosedByPeer,
    /// We closed deliberately and will ack the peer until it stops asking
    FinWait,
    /// A local failure (bad crypt, timeout) ended the connection
    ProblemDetectedLocally,
    /// Nothing further will happen; resources may be reclaimed
    Dead,
}

impl State {
    /// Whether the peer would consider us an active endpoint
    pub(crate) fn is_connected_for_wire(self) -> bool {
        matches!(self, State::Connected | State::Linger)
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(
            self,
            State::ClosedByPeer | State::FinWait | State::ProblemDetectedLocally | State::Dead
        )
    }
}

/// Why a connection ended, as carried in ConnectionClosed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Normal application-requested close
    App,
    /// Unspecified local failure
    MiscGeneric,
    MiscInternalError,
    /// Handshake or keepalive deadline passed
    MiscTimeout,
    /// The peer's certificate or crypt info was unusable
    RemoteBadCrypt,
    /// A code this build doesn't recognize
    Other(u32),
}

impl EndReason {
    pub(crate) fn to_u32(self) -> u32 {
        match self {
            EndReason::App => 1,
            EndReason::MiscGeneric => 2,
            EndReason::MiscInternalError => 3,
            EndReason::MiscTimeout => 4,
            EndReason::RemoteBadCrypt => 5,
            EndReason::Other(code) => code,
        }
    }

    pub(crate) fn from_u32(code: u32) -> Self {
        match code {
            1 => EndReason::App,
            2 => EndReason::MiscGeneric,
            3 => EndReason::MiscInternalError,
            4 => EndReason::MiscTimeout,
            5 => EndReason::RemoteBadCrypt,
            other => EndReason::Other(other),
        }
    }
}

/// Application-visible connection events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The handshake finished; data may flow
    Connected,
    /// The connection ended, locally or by the peer
    Closed {
        reason: EndReason,
        debug: String,
    },
}

/// Errors from [`Connection::connect`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The local identity is anonymous and configuration requires
    /// authentication
    #[error("unable to use an anonymous identity when authentication is required")]
    AuthRequired,
}

/// Errors from the outbound data path
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("connection is not in a connected state")]
    NotConnected,
    /// The chunk alone exceeds the datagram budget; nothing is ever truncated
    #[error("encrypted chunk does not fit in a datagram")]
    MtuOverflow,
}

/// One session with a single remote peer.
///
/// Created either by [`Connection::connect`] (client), by a [`Listener`]
/// accepting a handshake (server), or by [`new_loopback_pair`]. Performs no
/// I/O: feed inbound datagrams to [`handle`](Self::handle), drain outbound
/// ones from [`poll_transmit`](Self::poll_transmit), and drive timers via
/// [`poll_timeout`](Self::poll_timeout) / [`handle_timeout`](Self::handle_timeout).
///
/// [`Listener`]: crate::Listener
/// [`new_loopback_pair`]: crate::new_loopback_pair
pub struct Connection {
    side: Side,
    /// Whether we were accepted off a listener (vs initiated locally)
    on_listener: bool,
    remote: SocketAddr,
    local_identity: Identity,
    remote_identity: Option<Identity>,
    local_id: ConnectionId,
    remote_id: Option<ConnectionId>,
    state: State,
    config: Arc<ConnectionConfig>,
    crypto: Arc<dyn CryptoProvider>,
    session: Box<dyn Session>,
    /// Whether our own cert asserts our identity, so messages can skip the
    /// inline identity field
    cert_has_identity: bool,
    segments: Box<dyn SegmentLayer>,
    stats: EndToEndStats,
    ctx: Arc<TransportContext>,
    transmits: VecDeque<Transmit>,
    events: VecDeque<Event>,
    connect_started: Microseconds,
    next_retry: Microseconds,
    /// Peer's ConnectRequest timestamp and when we received it, echoed in
    /// ConnectOK
    handshake_remote_timestamp: Option<(u64, Microseconds)>,
    end_reason: Option<(EndReason, String)>,
    /// In-memory pair plumbing; set only on loopback connections
    loopback: Option<LoopbackIo>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("remote", &self.remote)
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Everything the listener hands over when a ConnectRequest passes muster
pub(crate) struct AcceptParams<'a> {
    pub config: Arc<ConnectionConfig>,
    pub local_identity: Identity,
    pub crypto: Arc<dyn CryptoProvider>,
    pub ctx: Arc<TransportContext>,
    pub segments: Box<dyn SegmentLayer>,
    pub remote: SocketAddr,
    pub remote_identity: Identity,
    pub remote_id: ConnectionId,
    pub local_id: ConnectionId,
    pub cert: &'a [u8],
    pub crypt: &'a [u8],
    pub ping_est_ms: Option<u32>,
    pub remote_timestamp: Option<u64>,
    pub packet_len: usize,
    pub now: Microseconds,
}

impl Connection {
    /// Initiate a connection to `remote`.
    ///
    /// The first ChallengeRequest is queued immediately; the handshake then
    /// retries on the configured interval until it completes or times out.
    pub fn connect(
        config: ClientConfig,
        remote: SocketAddr,
        segments: Box<dyn SegmentLayer>,
        transport_ctx: Arc<TransportContext>,
        now: Microseconds,
    ) -> Result<Self, ConnectError> {
        config.validate()?;
        if config.local_identity.is_localhost() && config.connection.ip_allow_without_auth == 0 {
            return Err(ConnectError::AuthRequired);
        }
        let mut rng = StdRng::from_entropy();
        let local_id = ConnectionId::random(&mut rng);
        transport_ctx.remember_local_id(local_id);
        let session = config.crypto.start_session(Side::Client);
        let cert_has_identity = config
            .crypto
            .identity_from_cert(session.local_cert())
            .ok()
            .flatten()
            .is_some();
        let keepalive = config.connection.keepalive_interval;
        let mut conn = Self {
            side: Side::Client,
            on_listener: false,
            remote,
            local_identity: config.local_identity,
            remote_identity: None,
            local_id,
            remote_id: None,
            state: State::Connecting,
            config: Arc::new(config.connection),
            crypto: config.crypto,
            session,
            cert_has_identity,
            segments,
            stats: EndToEndStats::new(now, keepalive),
            ctx: transport_ctx,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            connect_started: now,
            next_retry: now,
            handshake_remote_timestamp: None,
            end_reason: None,
            loopback: None,
        };
        conn.send_challenge_request(now);
        Ok(conn)
    }

    /// Server side: the listener verified the cookie and builds the child
    pub(crate) fn new_accept(params: AcceptParams<'_>) -> Result<Self, crate::crypto::CryptoError> {
        let mut session = params.crypto.start_session(Side::Server);
        let policy = params.config.unsigned_cert_policy();
        session.recv_handshake(params.cert, params.crypt, true, policy)?;
        let cert_has_identity = params
            .crypto
            .identity_from_cert(session.local_cert())
            .ok()
            .flatten()
            .is_some();
        params.ctx.remember_local_id(params.local_id);
        let mut stats = EndToEndStats::new(params.now, params.config.keepalive_interval);
        stats.track_recv_packet(params.packet_len, params.now);
        if let Some(ping) = params.ping_est_ms {
            if ping > 1500 {
                warn!(ping, "ignoring really large ping estimate in connect request");
            } else {
                stats.received_ping(ping, params.now);
            }
        }
        Ok(Self {
            side: Side::Server,
            on_listener: true,
            remote: params.remote,
            local_identity: params.local_identity,
            remote_identity: Some(params.remote_identity),
            local_id: params.local_id,
            remote_id: Some(params.remote_id),
            state: State::Connecting,
            config: params.config,
            crypto: params.crypto,
            session,
            cert_has_identity,
            segments: params.segments,
            stats,
            ctx: params.ctx,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            connect_started: params.now,
            next_retry: params.now,
            handshake_remote_timestamp: params.remote_timestamp.map(|ts| (ts, params.now)),
            end_reason: None,
            loopback: None,
        })
    }

    /// Loopback side: born Connected, with the peer reached through shared
    /// queues instead of the wire. Initial state-change events are not
    /// surfaced.
    pub(crate) fn new_loopback(
        config: Arc<ConnectionConfig>,
        local_identity: Identity,
        remote_identity: Identity,
        local_id: ConnectionId,
        remote_id: ConnectionId,
        crypto: Arc<dyn CryptoProvider>,
        session: Box<dyn Session>,
        segments: Box<dyn SegmentLayer>,
        ctx: Arc<TransportContext>,
        io: LoopbackIo,
        now: Microseconds,
    ) -> Self {
        let keepalive = config.keepalive_interval;
        ctx.remember_local_id(local_id);
        Self {
            side: Side::Client,
            on_listener: false,
            remote: io.fake_addr(),
            local_identity,
            remote_identity: Some(remote_identity),
            local_id,
            remote_id: Some(remote_id),
            state: State::Connected,
            config,
            crypto,
            session,
            cert_has_identity: false,
            segments,
            stats: EndToEndStats::new(now, keepalive),
            ctx,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            connect_started: now,
            next_retry: now,
            handshake_remote_timestamp: None,
            end_reason: None,
            loopback: Some(io),
        }
    }

    //
    // Accessors
    //

    pub fn state(&self) -> State {
        self.state
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn local_connection_id(&self) -> ConnectionId {
        self.local_id
    }

    /// The peer's connection ID, once the handshake has latched it
    pub fn remote_connection_id(&self) -> Option<ConnectionId> {
        self.remote_id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_identity(&self) -> Option<&Identity> {
        self.remote_identity.as_ref()
    }

    pub fn stats(&self) -> &EndToEndStats {
        &self.stats
    }

    /// Human-readable peer description for diagnostics
    pub fn description(&self) -> String {
        match &self.remote_identity {
            Some(Identity::Address(addr)) if *addr == self.remote => format!("UDP {}", self.remote),
            Some(identity) if !identity.is_localhost() => {
                format!("UDP {}@{}", identity, self.remote)
            }
            _ => format!("UDP {}", self.remote),
        }
    }

    //
    // Sans-I/O surface
    //

    /// Next queued application event
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Next datagram to put on the wire
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// When [`handle_timeout`](Self::handle_timeout) next wants to run
    pub fn poll_timeout(&self) -> Option<Microseconds> {
        match self.state {
            State::Connecting if !self.on_listener => Some(
                self.next_retry
                    .min(self.connect_started + self.config.connect_timeout),
            ),
            State::Connected | State::Linger if self.loopback.is_none() => {
                Some(self.stats.next_think_time())
            }
            _ => None,
        }
    }

    /// Drive retries, keepalives, and scheduled stats
    pub fn handle_timeout(&mut self, now: Microseconds) {
        match self.state {
            State::Connecting if !self.on_listener => {
                if now >= self.connect_started + self.config.connect_timeout {
                    self.problem_detected(
                        now,
                        EndReason::MiscTimeout,
                        "timed out attempting to connect",
                    );
                    return;
                }
                if now >= self.next_retry {
                    // Start over from ChallengeRequest; the challenge has a
                    // short expiry anyway
                    self.send_challenge_request(now);
                }
            }
            State::Connected | State::Linger if self.loopback.is_none() => {
                if let Some(reason) = self.stats.need_to_send(now) {
                    self.send_stats_msg(ReplyRequest::NothingToSend, now, reason);
                }
            }
            _ => {}
        }
    }

    /// Process one datagram that arrived from this connection's peer address
    pub fn handle(&mut self, now: Microseconds, pkt: &[u8]) {
        if pkt.len() < MIN_PACKET_SIZE {
            report_bad_packet!(self.ctx, now, len = pkt.len(), "packet is too small");
            return;
        }

        // Data packets are the common case; check for them first
        if packet::is_data_packet(pkt[0]) {
            self.received_data(now, pkt);
            return;
        }

        self.stats.track_recv_packet(pkt.len(), now);

        match pkt[0] {
            wire::MSG_CHALLENGE_REPLY => match packet::decode_plain_msg(pkt) {
                Ok(msg) => self.received_challenge_reply(&msg, now),
                Err(e) => report_bad_packet!(self.ctx, now, %e, "bad ChallengeReply"),
            },
            wire::MSG_CONNECT_OK => match packet::decode_plain_msg(pkt) {
                Ok(msg) => self.received_connect_ok(&msg, now),
                Err(e) => report_bad_packet!(self.ctx, now, %e, "bad ConnectOK"),
            },
            wire::MSG_CONNECTION_CLOSED => match packet::decode_padded_msg(pkt) {
                Ok(msg) => self.received_connection_closed(&msg, now),
                Err(e) => report_bad_packet!(self.ctx, now, %e, "bad ConnectionClosed"),
            },
            wire::MSG_NO_CONNECTION => match packet::decode_plain_msg(pkt) {
                Ok(msg) => self.received_no_connection(&msg, now),
                Err(e) => report_bad_packet!(self.ctx, now, %e, "bad NoConnection"),
            },
            wire::MSG_CHALLENGE_REQUEST => {
                match packet::decode_padded_msg::<wire::ChallengeRequest>(pkt) {
                    Ok(msg) => self.received_challenge_or_connect_request(
                        "ChallengeRequest",
                        msg.connection_id,
                        now,
                    ),
                    Err(e) => report_bad_packet!(self.ctx, now, %e, "bad ChallengeRequest"),
                }
            }
            wire::MSG_CONNECT_REQUEST => {
                match packet::decode_plain_msg::<wire::ConnectRequest>(pkt) {
                    Ok(msg) => self.received_challenge_or_connect_request(
                        "ConnectRequest",
                        msg.client_connection_id,
                        now,
                    ),
                    Err(e) => report_bad_packet!(self.ctx, now, %e, "bad ConnectRequest"),
                }
            }
            lead => {
                report_bad_packet!(self.ctx, now, lead, "lead byte is not a known message ID")
            }
        }
    }

    /// Deliver anything the loopback peer has pushed at us
    pub fn drive_loopback(&mut self, now: Microseconds) {
        while let Some(item) = self.loopback.as_ref().and_then(LoopbackIo::pop_inbound) {
            match item {
                LoopbackItem::Chunk { seq, data } => {
                    if !self.state.is_connected_for_wire() {
                        continue;
                    }
                    self.stats.track_recv_packet(data.len(), now);
                    self.segments.process_plaintext_chunk(seq, &data, now);
                }
                LoopbackItem::Closed { reason, debug } => {
                    self.peer_closed(now, reason, debug);
                }
            }
        }
    }

    //
    // Outbound data path
    //

    /// Frame and queue one encrypted chunk, with whatever stats fit beside it.
    ///
    /// This is the entry point the reliable-segment layer drives; the chunk is
    /// opaque ciphertext by the time it gets here. Returns the datagram size.
    pub fn send_encrypted_data_chunk(
        &mut self,
        chunk: &[u8],
        now: Microseconds,
    ) -> Result<usize, SendError> {
        let mut ctx = SendContext::new(now, "data");
        self.populate_send_context(&mut ctx, ReplyRequest::NothingToSend);
        self.send_data_internal(chunk, &mut ctx)
    }

    /// Datagram space left for a chunk once the pending stats are accounted
    pub fn max_encrypted_payload(&self, ctx_blob_size: usize) -> usize {
        self.config
            .max_udp_payload
            .saturating_sub(DATA_HEADER_SIZE + ctx_blob_size)
    }

    fn send_data_internal(
        &mut self,
        chunk: &[u8],
        ctx: &mut SendContext,
    ) -> Result<usize, SendError> {
        if !self.state.is_connected_for_wire() {
            return Err(SendError::NotConnected);
        }
        let Some(remote_id) = self.remote_id else {
            return Err(SendError::NotConnected);
        };

        if let Some(io) = &self.loopback {
            // Short-circuit: no wire encoding, plaintext straight to the peer
            let seq = self.stats.send_sequence();
            self.stats.consume_send_packet_number();
            self.stats.track_sent_packet(chunk.len(), ctx.now);
            io.push_outbound(LoopbackItem::Chunk {
                seq,
                data: Bytes::copy_from_slice(chunk),
            });
            return Ok(chunk.len());
        }

        // The chunk is sacred; only the stats blob may shrink
        let Some(headroom) = self
            .config
            .max_udp_payload
            .checked_sub(DATA_HEADER_SIZE + chunk.len())
        else {
            debug_assert!(false, "chunk exceeds datagram budget");
            return Err(SendError::MtuOverflow);
        };
        ctx.shrink_to_fit(headroom);

        let wire_seq = self.stats.consume_send_packet_number();
        let mut head = BytesMut::with_capacity(DATA_HEADER_SIZE + ctx.blob_size);
        let mut header = DataHeader {
            flags: DATA_PACKET_BIT,
            to_connection_id: remote_id.to_u32(),
            wire_seq,
        };
        let mut blob = BytesMut::with_capacity(ctx.blob_size);
        if ctx.serialize(&mut blob) {
            header.flags |= FLAG_PROTOBUF_BLOB;
            self.stats.track_sent_stats(&ctx.msg, ctx.now);
        }
        header.encode(&mut head);
        head.put(blob);

        // Gather send: header (+stats) and the chunk as separate segments
        Ok(self.send_raw_gather(&[&head[..], chunk], ctx.now))
    }

    /// Flush stats/acks to the peer right now, prodding it as requested.
    ///
    /// Useful for explicit latency probes; the scheduled machinery calls the
    /// same path on its own.
    pub fn send_stats_now(&mut self, now: Microseconds, reply_requested: ReplyRequest) {
        if !self.state.is_connected_for_wire() {
            return;
        }
        self.send_stats_msg(reply_requested, now, "application");
    }

    /// Send a (possibly payload-less) data packet just to carry stats/acks
    fn send_stats_msg(
        &mut self,
        reply_requested: ReplyRequest,
        now: Microseconds,
        reason: &'static str,
    ) {
        let mut ctx = SendContext::new(now, reason);
        self.populate_send_context(&mut ctx, reply_requested);
        let _ = self.send_data_internal(&[], &mut ctx);
    }

    /// Decide which acks/stats ride along with the next data packet
    fn populate_send_context(&mut self, ctx: &mut SendContext, reply_requested: ReplyRequest) {
        let now = ctx.now;
        let mut flags = 0;
        let mut tracer = 0;
        if reply_requested == ReplyRequest::Immediate || self.stats.need_to_send_ping_immediate(now)
        {
            flags |= Stats::ACK_REQUEST_E2E | Stats::ACK_REQUEST_IMMEDIATE;
        } else if reply_requested == ReplyRequest::DelayedOk
            || self.stats.need_to_send_keepalive(now)
        {
            flags |= Stats::ACK_REQUEST_E2E;
        } else {
            tracer = self.stats.ready_to_send_tracer_ping(now);
            if tracer > 1 {
                flags |= Stats::ACK_REQUEST_E2E;
            }
        }
        ctx.requested_flags = flags;
        if self.stats.ack_pending() {
            ctx.msg.ack_seq = self.stats.ack_seq();
        }

        if self.stats.need_to_send_stats(now) {
            // Stats must go out; reserve their space before the payload
            ctx.stats_need = StatsNeed::Required;
            let mut quality = wire::QualityStats::default();
            self.stats.populate_message(&mut quality, now);
            ctx.msg.stats = Some(quality);
            if tracer > 0 {
                ctx.requested_flags |= Stats::ACK_REQUEST_E2E;
            }
            ctx.slam_flags_and_calc_size();
        } else {
            ctx.slam_flags_and_calc_size();
            // Room permitting, send stats we'd merely like to send
            if self.stats.ready_to_send_stats(now) {
                if tracer > 0 {
                    ctx.requested_flags |= Stats::ACK_REQUEST_E2E;
                }
                let mut quality = wire::QualityStats::default();
                self.stats.populate_message(&mut quality, now);
                ctx.msg.stats = Some(quality);
                ctx.slam_flags_and_calc_size();
                ctx.stats_need = StatsNeed::Opportunistic;
            }
        }
    }

    //
    // Inbound data path
    //

    fn received_data(&mut self, now: Microseconds, pkt: &[u8]) {
        let (header, rest) = match DataHeader::decode(pkt) {
            Ok(x) => x,
            Err(e) => {
                report_bad_packet!(self.ctx, now, %e, "bad data packet");
                return;
            }
        };

        if header.to_connection_id != self.local_id.to_u32() {
            // Wrong session: could be stale, could be spoofed
            report_bad_packet!(
                self.ctx,
                now,
                to = header.to_connection_id,
                "data packet has incorrect connection ID"
            );
            if self.ctx.may_send_spam_reply(now) {
                self.send_no_connection(header.to_connection_id, 0);
            }
            return;
        }

        match self.state {
            State::Dead => {
                debug_assert!(false, "handling a packet on a dead connection");
                return;
            }
            State::ClosedByPeer | State::FinWait | State::ProblemDetectedLocally => {
                self.send_connection_closed_or_no_connection();
                return;
            }
            // Half-closed; inbound data is known to be ignored
            State::Linger => return,
            // Most likely our ConnectOK/their ConnectOK got lost; we can't
            // decrypt anything yet
            State::Connecting => return,
            State::Connected => {}
        }

        self.stats.track_recv_packet(pkt.len(), now);

        // Inline stats blob?
        let mut chunk = rest;
        let mut inline_stats = None;
        if header.flags & FLAG_PROTOBUF_BLOB != 0 {
            let mut cursor = rest;
            let blob_len = match prost::encoding::decode_varint(&mut cursor) {
                Ok(len) => len as usize,
                Err(_) => {
                    report_bad_packet!(self.ctx, now, "failed to decode size of stats blob");
                    return;
                }
            };
            if blob_len > cursor.len() {
                report_bad_packet!(
                    self.ctx,
                    now,
                    blob_len,
                    packet_len = pkt.len(),
                    "stats blob size doesn't make sense"
                );
                return;
            }
            let mut msg = match wire::Stats::decode(&cursor[..blob_len]) {
                Ok(msg) => msg,
                Err(e) => {
                    report_bad_packet!(self.ctx, now, %e, "failed to parse inline stats");
                    return;
                }
            };
            // Stamp the wire sequence so ack bookkeeping knows what to pend
            msg.seq_num = Some(u32::from(header.wire_seq));
            inline_stats = Some(msg);
            chunk = &cursor[blob_len..];
        }

        // Decrypt and reconstruct the full sequence number
        let mut plain = Vec::with_capacity(chunk.len());
        let Some(full_seq) = self
            .session
            .decrypt_data_chunk(header.wire_seq, chunk, &mut plain)
        else {
            return;
        };
        self.stats.note_recv_wire_seq(header.wire_seq);

        // Hand plaintext up; an empty chunk is just a stats/keepalive carrier
        if !plain.is_empty()
            && !self.segments.process_plaintext_chunk(full_seq, &plain, now)
        {
            return;
        }

        if let Some(msg) = inline_stats {
            self.recv_stats(&msg, true, now);
        }
    }

    fn recv_stats(&mut self, msg: &wire::Stats, inline: bool, now: Microseconds) {
        self.stats.process_message(msg, now);
        trace!(
            inline,
            has_stats = msg.stats.is_some(),
            flags = msg.flags,
            "received stats"
        );

        if !self.state.is_connected_for_wire() {
            return;
        }

        // Queue outgoing acks as requested or implied
        let immediate = msg.flags & Stats::ACK_REQUEST_IMMEDIATE != 0;
        if msg.flags & Stats::ACK_REQUEST_E2E != 0 || msg.stats.is_some() {
            self.stats.queue_ack(immediate, now);
        }

        if let Some(reason) = self.stats.need_to_send(now) {
            self.send_stats_msg(ReplyRequest::NothingToSend, now, reason);
        }
    }

    //
    // Handshake, client side
    //

    fn send_challenge_request(&mut self, now: Microseconds) {
        debug_assert!(!self.on_listener && self.state == State::Connecting);
        let msg = wire::ChallengeRequest {
            connection_id: self.local_id.to_u32(),
            my_timestamp: Some(now as u64),
            protocol_version: PROTOCOL_VERSION,
        };
        self.send_padded_msg(wire::MSG_CHALLENGE_REQUEST, &msg, now);
        self.next_retry = now + self.config.connect_retry_interval;
        // The reply echoes our timestamp, so this counts as a ping probe
        self.stats.track_sent_ping_request(now);
    }

    fn received_challenge_reply(&mut self, msg: &wire::ChallengeReply, now: Microseconds) {
        if self.on_listener {
            report_bad_packet!(
                self.ctx,
                now,
                "ChallengeReply is only expected on locally-initiated connections"
            );
            return;
        }
        if self.state != State::Connecting {
            return;
        }
        // Wrong ID: stale or spoofed
        if msg.connection_id != self.local_id.to_u32() {
            report_bad_packet!(self.ctx, now, "ChallengeReply has incorrect connection ID");
            return;
        }
        if msg.protocol_version < MIN_PROTOCOL_VERSION {
            self.problem_detected(
                now,
                EndReason::MiscGeneric,
                "peer is running old software and needs to be updated",
            );
            return;
        }

        if let Some(ts) = msg.your_timestamp {
            self.apply_timestamp_echo(ts, 0, now, "ChallengeReply");
        }

        self.stats.peer_protocol_version = msg.protocol_version;

        // Reply with the challenge and our cert/crypt material
        let mut connect = wire::ConnectRequest {
            client_connection_id: self.local_id.to_u32(),
            challenge: msg.challenge,
            my_timestamp: Some(now as u64),
            ping_est_ms: self.stats.smoothed_ping_ms(),
            protocol_version: PROTOCOL_VERSION,
            ..Default::default()
        };
        if !self.session.local_cert().is_empty() {
            connect.cert = Some(self.session.local_cert().to_vec());
        }
        connect.crypt = Some(self.session.local_crypt().to_vec());
        if !self.cert_has_identity {
            connect.identity_string = Some(self.local_identity.to_string());
        }
        self.send_msg(wire::MSG_CONNECT_REQUEST, &connect, now);

        // If this reply is lost we start the whole handshake over; the
        // challenge has a short expiry anyway
        self.next_retry = now + self.config.connect_retry_interval;
        self.stats.track_sent_ping_request(now);
    }

    fn received_connect_ok(&mut self, msg: &wire::ConnectOk, now: Microseconds) {
        if self.on_listener {
            report_bad_packet!(
                self.ctx,
                now,
                "ConnectOK is only expected on locally-initiated connections"
            );
            return;
        }
        if msg.client_connection_id != self.local_id.to_u32() {
            report_bad_packet!(self.ctx, now, "ConnectOK has incorrect connection ID");
            return;
        }

        let (identity, identity_in_cert) = match extract_remote_identity(
            &*self.crypto,
            msg.cert.as_deref(),
            msg.identity_string.as_deref(),
        ) {
            Ok(x) => x,
            Err(e) => {
                report_bad_packet!(self.ctx, now, %e, "bad identity in ConnectOK");
                return;
            }
        };
        let identity = match apply_address_identity_rules(
            identity,
            identity_in_cert,
            self.remote,
            self.config.ip_allow_without_auth,
        ) {
            Ok(identity) => identity,
            Err(e) => {
                report_bad_packet!(self.ctx, now, e, "rejecting ConnectOK");
                return;
            }
        };
        // Make sure they are still who we think they are
        if let Some(expected) = &self.remote_identity {
            if *expected != identity {
                report_bad_packet!(
                    self.ctx,
                    now,
                    "ConnectOK identity doesn't match who we expect to be connecting to"
                );
                return;
            }
        }

        if let Some(ts) = msg.your_timestamp {
            self.apply_timestamp_echo(ts, msg.delay_time_usec.unwrap_or(0), now, "ConnectOK");
        }

        match self.state {
            State::Dead => {
                debug_assert!(false, "handling a packet on a dead connection");
                return;
            }
            State::ClosedByPeer | State::FinWait | State::ProblemDetectedLocally => {
                self.send_connection_closed_or_no_connection();
                return;
            }
            // Already established; this is a stale retransmit
            State::Linger | State::Connected => return,
            State::Connecting => {}
        }

        let remote_id = ConnectionId::new(msg.server_connection_id);
        if !remote_id.is_wire_valid() {
            self.problem_detected(now, EndReason::RemoteBadCrypt, "didn't send valid connection ID");
            return;
        }
        self.remote_id = Some(remote_id);
        self.remote_identity = Some(identity);

        // Check the cert, derive session keys
        if let Err(e) = self.session.recv_handshake(
            msg.cert.as_deref().unwrap_or(&[]),
            msg.crypt.as_deref().unwrap_or(&[]),
            false,
            self.config.unsigned_cert_policy(),
        ) {
            let debug = format!("failed crypto init: {e}");
            self.problem_detected(now, EndReason::RemoteBadCrypt, &debug);
            return;
        }

        self.set_state(now, State::Connected);
    }

    /// Convert a timestamp echo into a ping sample, if it's fresh enough
    fn apply_timestamp_echo(
        &mut self,
        your_timestamp: u64,
        delay_usec: u64,
        now: Microseconds,
        what: &'static str,
    ) {
        let elapsed = now - your_timestamp as Microseconds - delay_usec as Microseconds;
        if !(0..=TIMESTAMP_ECHO_WINDOW).contains(&elapsed) {
            warn!(your_timestamp, now, what, "ignoring weird timestamp echo");
            return;
        }
        let ping_ms = ((elapsed + 500) / 1000) as u32;
        self.stats.received_ping(ping_ms, now);
    }

    //
    // Handshake, server side
    //

    /// Install the delivery path for decrypted chunks
    pub(crate) fn set_segment_layer(&mut self, segments: Box<dyn SegmentLayer>) {
        self.segments = segments;
    }

    /// The application accepted; finish the handshake
    pub(crate) fn accept_application(&mut self, now: Microseconds) {
        debug_assert!(self.on_listener && self.state == State::Connecting);
        self.send_connect_ok(now);
        self.set_state(now, State::Connected);
    }

    fn send_connect_ok(&mut self, now: Microseconds) {
        debug_assert!(self.on_listener);
        let Some(remote_id) = self.remote_id else {
            debug_assert!(false, "accepted connection without a remote ID");
            return;
        };
        let mut msg = wire::ConnectOk {
            client_connection_id: remote_id.to_u32(),
            server_connection_id: self.local_id.to_u32(),
            crypt: Some(self.session.local_crypt().to_vec()),
            ..Default::default()
        };
        if !self.session.local_cert().is_empty() {
            msg.cert = Some(self.session.local_cert().to_vec());
        }
        if !self.cert_has_identity {
            msg.identity_string = Some(self.local_identity.to_string());
        }
        if let Some((ts, received_at)) = self.handshake_remote_timestamp {
            let elapsed = now - received_at;
            if elapsed < HANDSHAKE_TIMESTAMP_WINDOW {
                msg.your_timestamp = Some(ts);
                msg.delay_time_usec = Some(elapsed as u64);
            } else {
                warn!(
                    elapsed_ms = elapsed / 1000,
                    "discarding stale handshake timestamp, not echoing in ConnectOK"
                );
                self.handshake_remote_timestamp = None;
            }
        }
        self.send_msg(wire::MSG_CONNECT_OK, &msg, now);
    }

    /// Handshake packets arriving on an established mapping: either a lost
    /// reply being retried, or junk
    fn received_challenge_or_connect_request(
        &mut self,
        what: &'static str,
        packet_connection_id: u32,
        now: Microseconds,
    ) {
        if Some(packet_connection_id) != self.remote_id.map(ConnectionId::to_u32) {
            report_bad_packet!(
                self.ctx,
                now,
                what,
                "incorrect connection ID on an address we know"
            );
            return;
        }
        match self.state {
            State::Dead => debug_assert!(false, "handling a packet on a dead connection"),
            State::ClosedByPeer | State::FinWait | State::ProblemDetectedLocally => {
                self.send_connection_closed_or_no_connection();
            }
            // Waiting on the application; nothing to say yet
            State::Connecting => {}
            State::Linger | State::Connected => {
                if !self.on_listener {
                    report_bad_packet!(
                        self.ctx,
                        now,
                        what,
                        "peer we initiated a connection to shouldn't be sending this"
                    );
                    return;
                }
                // Totally legit: our earlier ConnectOK may have dropped
                self.send_connect_ok(now);
            }
        }
    }

    //
    // Teardown
    //

    fn received_connection_closed(&mut self, msg: &wire::ConnectionClosed, now: Microseconds) {
        // If the right connection ID, they aren't spoofing and the ack is
        // critical; if wrong, it may be a stale connection, but it could also
        // be garbage, so rate-limit.
        let remote_u32 = self.remote_id.map_or(0, ConnectionId::to_u32);
        let id_match = msg.to_connection_id == self.local_id.to_u32()
            || (msg.to_connection_id == 0
                && msg.from_connection_id != 0
                && msg.from_connection_id == remote_u32);
        if id_match || self.ctx.may_send_spam_reply(now) {
            // Echo exactly what they sent us
            self.send_no_connection(msg.to_connection_id, msg.from_connection_id);
        }
        if !id_match {
            return;
        }
        self.peer_closed(
            now,
            EndReason::from_u32(msg.reason_code),
            msg.debug.clone(),
        );
    }

    fn received_no_connection(&mut self, msg: &wire::NoConnection, now: Microseconds) {
        // Must be an ack of something we would have sent
        let remote_u32 = self.remote_id.map_or(0, ConnectionId::to_u32);
        if msg.to_connection_id != self.local_id.to_u32() || msg.from_connection_id != remote_u32 {
            report_bad_packet!(
                self.ctx,
                now,
                "NoConnection is for a stale connection or spoofed"
            );
            return;
        }
        self.peer_closed(now, EndReason::Other(0), String::new());
    }

    fn peer_closed(&mut self, now: Microseconds, reason: EndReason, debug: String) {
        if self.state.is_terminal() {
            return;
        }
        self.end_reason = Some((reason, debug));
        self.set_state(now, State::ClosedByPeer);
    }

    /// Deliberately end the connection; the peer is told until it acks
    pub fn close(&mut self, now: Microseconds, reason: EndReason, debug: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.end_reason = Some((reason, debug.into()));
        self.set_state(now, State::FinWait);
    }

    /// Half-close: keep draining our sends, ignore all further inbound data
    pub fn linger(&mut self, now: Microseconds) {
        if self.state == State::Connected {
            self.set_state(now, State::Linger);
        }
    }

    /// The embedder has detached this connection; no further packets flow
    pub fn mark_dead(&mut self) {
        self.state = State::Dead;
    }

    fn problem_detected(&mut self, now: Microseconds, reason: EndReason, debug_msg: &str) {
        if self.state.is_terminal() {
            return;
        }
        debug!(?reason, debug = %debug_msg, "problem detected locally");
        self.end_reason = Some((reason, debug_msg.into()));
        self.set_state(now, State::ProblemDetectedLocally);
    }

    fn set_state(&mut self, _now: Microseconds, new: State) {
        if self.state == new {
            return;
        }
        let old = self.state;
        self.state = new;
        trace!(?old, ?new, id = %self.local_id, "connection state changed");
        match new {
            State::Connected => self.events.push_back(Event::Connected),
            State::FinWait | State::ProblemDetectedLocally => {
                self.send_connection_closed_or_no_connection();
                self.queue_closed_event(old);
            }
            State::ClosedByPeer => {
                // The inbound path already acked; just surface the event
                self.queue_closed_event(old);
            }
            State::Connecting | State::Linger | State::Dead => {}
        }
    }

    fn queue_closed_event(&mut self, old: State) {
        if old.is_terminal() {
            return;
        }
        let (reason, debug) = self
            .end_reason
            .clone()
            .unwrap_or((EndReason::MiscGeneric, String::new()));
        self.events.push_back(Event::Closed { reason, debug });
    }

    fn send_connection_closed_or_no_connection(&mut self) {
        if let Some(io) = &self.loopback {
            let (reason, debug) = self
                .end_reason
                .clone()
                .unwrap_or((EndReason::App, String::new()));
            io.push_outbound(LoopbackItem::Closed { reason, debug });
            return;
        }
        if self.state == State::ClosedByPeer {
            self.send_no_connection(
                self.local_id.to_u32(),
                self.remote_id.map_or(0, ConnectionId::to_u32),
            );
        } else {
            let (reason, debug) = self
                .end_reason
                .clone()
                .unwrap_or((EndReason::MiscGeneric, String::new()));
            let msg = wire::ConnectionClosed {
                from_connection_id: self.local_id.to_u32(),
                to_connection_id: self.remote_id.map_or(0, ConnectionId::to_u32),
                reason_code: reason.to_u32(),
                debug,
            };
            self.send_padded_msg_nontracked(wire::MSG_CONNECTION_CLOSED, &msg);
        }
    }

    fn send_no_connection(&mut self, from_connection_id: u32, to_connection_id: u32) {
        if from_connection_id == 0 && to_connection_id == 0 {
            debug_assert!(false, "NoConnection needs at least one of from/to");
            return;
        }
        let msg = wire::NoConnection {
            from_connection_id,
            to_connection_id,
        };
        match packet::encode_plain_msg(wire::MSG_NO_CONNECTION, &msg) {
            Ok(contents) => self.queue_transmit(contents),
            Err(e) => debug_assert!(false, "{e}"),
        }
    }

    //
    // Raw send helpers
    //

    fn send_msg<M: Message>(&mut self, tag: u8, msg: &M, now: Microseconds) {
        match packet::encode_plain_msg(tag, msg) {
            Ok(contents) => {
                self.stats.track_sent_packet(contents.len(), now);
                self.queue_transmit(contents);
            }
            Err(e) => debug_assert!(false, "{e}"),
        }
    }

    fn send_padded_msg<M: Message>(&mut self, tag: u8, msg: &M, now: Microseconds) {
        match packet::encode_padded_msg(tag, msg) {
            Ok(contents) => {
                self.stats.track_sent_packet(contents.len(), now);
                self.queue_transmit(contents);
            }
            Err(e) => debug_assert!(false, "{e}"),
        }
    }

    /// Teardown messages don't bother with stats bookkeeping
    fn send_padded_msg_nontracked<M: Message>(&mut self, tag: u8, msg: &M) {
        match packet::encode_padded_msg(tag, msg) {
            Ok(contents) => self.queue_transmit(contents),
            Err(e) => debug_assert!(false, "{e}"),
        }
    }

    /// Assemble gather segments into one datagram and queue it
    fn send_raw_gather(&mut self, segments: &[&[u8]], now: Microseconds) -> usize {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        debug_assert!(total <= self.config.max_udp_payload);
        let mut buf = BytesMut::with_capacity(total);
        for segment in segments {
            buf.put_slice(segment);
        }
        self.stats.track_sent_packet(total, now);
        self.queue_transmit(buf.freeze());
        total
    }

    fn queue_transmit(&mut self, contents: Bytes) {
        if self.loopback.is_some() {
            // Loopback peers exchange nothing over the wire
            return;
        }
        self.transmits.push_back(Transmit {
            destination: self.remote,
            contents,
        });
    }
}

/// Figure out who the peer claims to be: cert first, then the inline identity
/// field, and failing both, the anonymous localhost identity. The bool is
/// whether the identity was asserted by the cert.
pub(crate) fn extract_remote_identity(
    crypto: &dyn CryptoProvider,
    cert: Option<&[u8]>,
    identity_string: Option<&str>,
) -> Result<(Identity, bool), String> {
    if let Some(cert) = cert {
        match crypto.identity_from_cert(cert) {
            Ok(Some(identity)) => return Ok((identity, true)),
            Ok(None) => {}
            Err(e) => return Err(format!("bad identity in cert: {e}")),
        }
    }
    if let Some(s) = identity_string {
        let identity = s
            .parse::<Identity>()
            .map_err(|e| format!("bad identity: {e}"))?;
        return Ok((identity, false));
    }
    // No identity presented is the same as claiming to be localhost
    Ok((Identity::LocalHost, false))
}

/// Address-flavored identities get extra scrutiny: the anonymous one needs
/// config permission and becomes the observed address; a specific address must
/// have been cert-asserted.
pub(crate) fn apply_address_identity_rules(
    identity: Identity,
    identity_in_cert: bool,
    src: SocketAddr,
    ip_allow_without_auth: u32,
) -> Result<Identity, &'static str> {
    match identity {
        Identity::LocalHost => {
            if ip_allow_without_auth == 0 {
                return Err("unauthenticated connections not allowed");
            }
            // Their identity becomes their observed address, port included
            Ok(Identity::Address(src))
        }
        Identity::Address(_) if !identity_in_cert => {
            // The use case for claiming a specific address without a cert is
            // unclear at best; if there's a cert, assume it's meaningful
            Err("cannot use specific IP address identity without a cert")
        }
        other => Ok(other),
    }
}
