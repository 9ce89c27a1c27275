//! End-to-end statistics bookkeeping and the inline-stats packing logic.
//!
//! Every data packet consumes a sequence number here and may piggyback a
//! stats/ack blob. The engine decides *when* something must ride along
//! (ack owed to the peer, keepalive, ping probe, periodic stats) and
//! [`SendContext`] decides *how much* of it fits next to the chunk.

use bytes::BytesMut;
use prost::Message;
use tracing::trace;

use crate::wire::{self, Stats};
use crate::Microseconds;

/// Grace period for a delayed (non-immediate) ack
const ACK_DELAY: Microseconds = 250_000;
/// How often full quality stats are pushed to the peer
const STATS_INTERVAL: Microseconds = 20_000_000;
/// How long we wait for a ping reply before asking again
const PING_RETRY_INTERVAL: Microseconds = 1_000_000;
/// Cadence of route-quality tracer pings while otherwise idle
const TRACER_PING_INTERVAL: Microseconds = 7_000_000;

/// What kind of reply the caller wants the peer prodded for
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReplyRequest {
    /// Send only what the schedule already demands
    NothingToSend,
    /// Ask for an ack whenever the peer gets around to it
    DelayedOk,
    /// Ask for an ack as soon as the peer processes the packet
    Immediate,
}

/// Per-connection end-to-end statistics engine
pub struct EndToEndStats {
    created_at: Microseconds,
    keepalive_interval: Microseconds,

    /// Full sequence number of the next outgoing data packet
    next_send_seq: u64,
    packets_sent: u64,
    bytes_sent: u64,
    packets_recv: u64,
    bytes_recv: u64,
    last_send: Microseconds,
    last_recv: Microseconds,

    /// Smoothed RTT estimate in ms, negative while unknown
    smoothed_ping_ms: i32,
    last_ping_request: Microseconds,

    /// Highest data-packet wire sequence received, for acks
    last_recv_wire_seq: u16,
    /// Deadline by which we owe the peer an ack, if any
    ack_due: Option<Microseconds>,
    last_stats_send: Microseconds,

    pub(crate) peer_protocol_version: u32,
    peer_ping_ms: Option<u32>,
}

impl EndToEndStats {
    pub(crate) fn new(now: Microseconds, keepalive_interval: Microseconds) -> Self {
        Self {
            created_at: now,
            keepalive_interval,
            next_send_seq: 1,
            packets_sent: 0,
            bytes_sent: 0,
            packets_recv: 0,
            bytes_recv: 0,
            last_send: now,
            last_recv: now,
            smoothed_ping_ms: -1,
            last_ping_request: now,
            last_recv_wire_seq: 0,
            ack_due: None,
            last_stats_send: now,
            peer_protocol_version: 0,
            peer_ping_ms: None,
        }
    }

    /// Claim the next packet sequence and return its wire form
    pub(crate) fn consume_send_packet_number(&mut self) -> u16 {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        seq as u16
    }

    /// Full sequence number the next data packet will carry
    pub fn send_sequence(&self) -> u64 {
        self.next_send_seq
    }

    pub(crate) fn track_sent_packet(&mut self, bytes: usize, now: Microseconds) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
        self.last_send = now;
    }

    pub(crate) fn track_recv_packet(&mut self, bytes: usize, now: Microseconds) {
        self.packets_recv += 1;
        self.bytes_recv += bytes as u64;
        self.last_recv = now;
    }

    pub(crate) fn note_recv_wire_seq(&mut self, wire_seq: u16) {
        self.last_recv_wire_seq = wire_seq;
    }

    /// Feed one RTT sample into the smoothed estimate
    pub(crate) fn received_ping(&mut self, ping_ms: u32, _now: Microseconds) {
        let ping_ms = ping_ms as i32;
        self.smoothed_ping_ms = if self.smoothed_ping_ms < 0 {
            ping_ms
        } else {
            (self.smoothed_ping_ms * 7 + ping_ms) / 8
        };
    }

    /// Smoothed RTT estimate in ms, if we have one
    pub fn smoothed_ping_ms(&self) -> Option<u32> {
        u32::try_from(self.smoothed_ping_ms).ok()
    }

    /// Ping the peer reports seeing, if it told us
    pub fn peer_ping_ms(&self) -> Option<u32> {
        self.peer_ping_ms
    }

    /// Protocol version the peer negotiated, zero until known
    pub fn peer_protocol_version(&self) -> u32 {
        self.peer_protocol_version
    }

    /// A handshake packet that the peer answers with a timestamp echo counts
    /// as an outstanding ping probe.
    pub(crate) fn track_sent_ping_request(&mut self, now: Microseconds) {
        self.last_ping_request = now;
    }

    /// Record that the peer asked for (or implied) an end-to-end ack
    pub(crate) fn queue_ack(&mut self, immediate: bool, now: Microseconds) {
        let deadline = if immediate { now } else { now + ACK_DELAY };
        self.ack_due = Some(self.ack_due.map_or(deadline, |d| d.min(deadline)));
    }

    /// Process a stats message received from the peer (inline or standalone)
    pub(crate) fn process_message(&mut self, msg: &wire::Stats, now: Microseconds) {
        if let Some(quality) = &msg.stats {
            if let Some(instantaneous) = &quality.instantaneous {
                self.peer_ping_ms = instantaneous.ping_ms;
            }
        }
        // Any ack of our sequence space settles the outstanding ping probe
        if msg.ack_seq.is_some() {
            self.last_ping_request = now;
        }
    }

    pub(crate) fn need_to_send_ping_immediate(&self, now: Microseconds) -> bool {
        self.smoothed_ping_ms < 0 && now >= self.last_ping_request + PING_RETRY_INTERVAL
    }

    pub(crate) fn need_to_send_keepalive(&self, now: Microseconds) -> bool {
        now >= self.last_send + self.keepalive_interval
    }

    pub(crate) fn need_to_send_stats(&self, now: Microseconds) -> bool {
        self.ack_due.is_some_and(|d| now >= d)
            || now >= self.last_stats_send + STATS_INTERVAL
    }

    /// Whether stats are worth sending if a packet is going out anyway
    pub(crate) fn ready_to_send_stats(&self, now: Microseconds) -> bool {
        self.ack_due.is_some() || now >= self.last_stats_send + STATS_INTERVAL / 2
    }

    /// 0 = not yet, 1 = ready, 2 = more than ready
    pub(crate) fn ready_to_send_tracer_ping(&self, now: Microseconds) -> i32 {
        let elapsed = now - self.last_ping_request;
        if elapsed >= TRACER_PING_INTERVAL + 2_000_000 {
            2
        } else if elapsed >= TRACER_PING_INTERVAL {
            1
        } else {
            0
        }
    }

    /// The single reason we must manufacture a packet right now, if any
    pub(crate) fn need_to_send(&self, now: Microseconds) -> Option<&'static str> {
        if self.ack_due.is_some_and(|d| now >= d) {
            Some("ack")
        } else if self.need_to_send_ping_immediate(now) {
            Some("ping")
        } else if self.need_to_send_keepalive(now) {
            Some("keepalive")
        } else if now >= self.last_stats_send + STATS_INTERVAL {
            Some("stats")
        } else {
            None
        }
    }

    /// Earliest time one of the predicates above will fire
    pub(crate) fn next_think_time(&self) -> Microseconds {
        let mut next = self.last_send + self.keepalive_interval;
        next = next.min(self.last_stats_send + STATS_INTERVAL);
        if let Some(deadline) = self.ack_due {
            next = next.min(deadline);
        }
        if self.smoothed_ping_ms < 0 {
            next = next.min(self.last_ping_request + PING_RETRY_INTERVAL);
        }
        next
    }

    /// Fill the quality submessage with current numbers
    pub(crate) fn populate_message(&self, quality: &mut wire::QualityStats, now: Microseconds) {
        quality.lifetime = Some(wire::LifetimeStats {
            packets_sent: self.packets_sent,
            bytes_sent: self.bytes_sent,
            packets_recv: self.packets_recv,
            bytes_recv: self.bytes_recv,
        });
        let elapsed = (now - self.created_at).max(1) as u64;
        quality.instantaneous = Some(wire::InstantaneousStats {
            ping_ms: self.smoothed_ping_ms(),
            packets_out_per_sec_x10: (self.packets_sent * 10_000_000 / elapsed) as u32,
            packets_in_per_sec_x10: (self.packets_recv * 10_000_000 / elapsed) as u32,
        });
    }

    /// Highest received wire sequence, for the ack field
    pub(crate) fn ack_seq(&self) -> Option<u32> {
        (self.packets_recv > 0).then_some(u32::from(self.last_recv_wire_seq))
    }

    pub(crate) fn ack_pending(&self) -> bool {
        self.ack_due.is_some()
    }

    /// Bookkeeping for a stats blob that actually went out on the wire
    pub(crate) fn track_sent_stats(&mut self, msg: &wire::Stats, now: Microseconds) {
        if msg.stats.is_some() {
            self.last_stats_send = now;
        }
        if msg.ack_seq.is_some() {
            self.ack_due = None;
        }
        if msg.flags & Stats::ACK_REQUEST_E2E != 0 {
            // Counts as a ping probe; the reply timestamp settles it
            self.last_ping_request = now;
        }
    }
}

/// Everything a data packet needs to know about the stats riding along with
/// it: requested ack flags, the serialized blob, and how badly it must go out.
pub(crate) struct SendContext {
    pub now: Microseconds,
    pub reason: &'static str,
    pub msg: wire::Stats,
    pub requested_flags: u32,
    pub stats_need: StatsNeed,
    /// Serialized size of the blob including its varint length prefix
    pub blob_size: usize,
}

/// How committed we are to the stats in a [`SendContext`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum StatsNeed {
    /// Nothing riding along
    None,
    /// Send if the chunk leaves room
    Opportunistic,
    /// Space was reserved; failure to fit is a bug
    Required,
}

impl SendContext {
    pub fn new(now: Microseconds, reason: &'static str) -> Self {
        Self {
            now,
            reason,
            msg: wire::Stats::default(),
            requested_flags: 0,
            stats_need: StatsNeed::None,
            blob_size: 0,
        }
    }

    /// Re-derive the effective flags and the serialized blob size
    pub fn slam_flags_and_calc_size(&mut self) {
        self.msg.flags = self.requested_flags | self.msg.implied_flags();
        self.blob_size = if self.msg.is_empty() {
            0
        } else {
            let len = self.msg.encoded_len();
            prost::encoding::encoded_len_varint(len as u64) + len
        };
    }

    /// Shrink the blob until it fits `budget` bytes.
    ///
    /// Priority order: ack flags survive everything, then lifetime stats,
    /// then instantaneous stats. The data chunk is never the thing trimmed.
    pub fn shrink_to_fit(&mut self, budget: usize) {
        while self.blob_size > budget {
            if let Some(quality) = &mut self.msg.stats {
                debug_assert!(
                    self.stats_need < StatsNeed::Required,
                    "reserved stats no longer fit"
                );
                if quality.instantaneous.is_some() && quality.lifetime.is_some() {
                    quality.instantaneous = None;
                } else {
                    self.msg.stats = None;
                }
                self.slam_flags_and_calc_size();
                continue;
            }
            // Even the bare flags/ack don't fit; they'll ride a later packet
            trace!(budget, "chunk leaves no room for any stats blob");
            self.msg = wire::Stats::default();
            self.blob_size = 0;
            break;
        }
    }

    /// Append `varint(len) || blob` to `buf`; returns whether anything was
    /// written
    pub fn serialize(&self, buf: &mut BytesMut) -> bool {
        if self.blob_size == 0 {
            return false;
        }
        let len = self.msg.encoded_len();
        prost::encoding::encode_varint(len as u64, buf);
        self.msg.encode(buf).expect("unbounded buffer");
        trace!(reason = self.reason, len, "piggybacking stats blob");
        true
    }
}
