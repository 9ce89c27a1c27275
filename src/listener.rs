//! The listen socket's packet demultiplexer.
//!
//! Datagrams from addresses we already know route straight to their child
//! connection. Everything else is unsolicited: it either advances the
//! stateless cookie handshake, acks a teardown, or gets dropped with a
//! rate-limited log line. No per-client state exists until a ConnectRequest
//! survives cookie verification.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use slab::Slab;
use tracing::{trace, warn};

use crate::challenge::{time_bucket, ChallengeKey};
use crate::connection::{
    apply_address_identity_rules, extract_remote_identity, AcceptParams, Connection, EndReason,
};
use crate::crypto::CryptoProvider;
use crate::packet::{self, is_data_packet};
use crate::segment::{Discard, SegmentLayer};
use crate::shared::report_bad_packet;
use crate::wire;
use crate::{
    ConfigError, ConnectionConfig, ConnectionId, Identity, ListenerConfig, Microseconds,
    Transmit, TransportContext, MIN_PACKET_SIZE, PROTOCOL_VERSION,
};

/// Identifier for a child [`Connection`] owned by a [`Listener`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(ch: ConnectionHandle) -> usize {
        ch.0
    }
}

/// Event resulting from processing a single unsolicited datagram
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ListenerEvent {
    /// A handshake passed cookie verification; the new child connection is
    /// waiting for [`Listener::accept_connection`] (or a close)
    Incoming(ConnectionHandle),
}

/// Accepts connections over a shared UDP socket.
///
/// Performs no I/O: the embedder feeds every datagram that arrives on the
/// socket to [`handle`](Self::handle) and drains
/// [`poll_transmit`](Self::poll_transmit).
pub struct Listener {
    local_identity: Identity,
    crypto: Arc<dyn CryptoProvider>,
    connection_config: Arc<ConnectionConfig>,
    ctx: Arc<TransportContext>,
    /// Secret behind every cookie we issue; dies with the listener
    challenge_key: ChallengeKey,
    connections: Slab<Connection>,
    by_addr: FxHashMap<SocketAddr, ConnectionHandle>,
    /// At most one child per (identity, remote connection ID)
    by_peer: FxHashMap<(Identity, ConnectionId), ConnectionHandle>,
    transmits: VecDeque<Transmit>,
    rng: StdRng,
}

impl Listener {
    pub fn new(
        config: ListenerConfig,
        ctx: Arc<TransportContext>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = StdRng::from_entropy();
        Ok(Self {
            local_identity: config.local_identity,
            crypto: config.crypto,
            connection_config: Arc::new(config.connection),
            ctx,
            challenge_key: ChallengeKey::new(&mut rng),
            connections: Slab::new(),
            by_addr: FxHashMap::default(),
            by_peer: FxHashMap::default(),
            transmits: VecDeque::new(),
            rng,
        })
    }

    /// Process one datagram that arrived on the shared socket
    pub fn handle(
        &mut self,
        now: Microseconds,
        remote: SocketAddr,
        pkt: &[u8],
    ) -> Option<ListenerEvent> {
        if let Some(&ch) = self.by_addr.get(&remote) {
            self.connections[ch.0].handle(now, pkt);
            return None;
        }
        self.received_from_unknown_host(now, remote, pkt)
    }

    fn received_from_unknown_host(
        &mut self,
        now: Microseconds,
        remote: SocketAddr,
        pkt: &[u8],
    ) -> Option<ListenerEvent> {
        if pkt.len() < MIN_PACKET_SIZE {
            report_bad_packet!(self.ctx, now, %remote, len = pkt.len(), "packet is too small");
            return None;
        }

        if is_data_packet(pkt[0]) {
            if pkt[..4] == [0xff; 4] {
                // Legacy connectionless packet (discovery broadcast etc).
                // Ignore without spew.
            } else if pkt.len() >= packet::DATA_HEADER_SIZE
                && self.ctx.is_recent_local_id(ConnectionId::new(u32::from_le_bytes(
                    pkt[1..5].try_into().unwrap(),
                )))
            {
                // Late packet for a connection we recently tore down; the
                // peer will figure it out without us spamming the log
                trace!(%remote, "dropping stray data for a recently closed connection");
            } else {
                report_bad_packet!(
                    self.ctx,
                    now,
                    %remote,
                    "stray data packet from host with no connection"
                );
            }
            return None;
        }

        match pkt[0] {
            wire::MSG_CHALLENGE_REQUEST => {
                match packet::decode_padded_msg::<wire::ChallengeRequest>(pkt) {
                    Ok(msg) => self.received_challenge_request(&msg, remote, now),
                    Err(e) => report_bad_packet!(self.ctx, now, %remote, %e, "bad ChallengeRequest"),
                }
                None
            }
            wire::MSG_CONNECT_REQUEST => {
                match packet::decode_plain_msg::<wire::ConnectRequest>(pkt) {
                    Ok(msg) => self.received_connect_request(&msg, remote, pkt.len(), now),
                    Err(e) => {
                        report_bad_packet!(self.ctx, now, %remote, %e, "bad ConnectRequest");
                        None
                    }
                }
            }
            wire::MSG_CONNECTION_CLOSED => {
                match packet::decode_padded_msg::<wire::ConnectionClosed>(pkt) {
                    Ok(msg) => self.received_connection_closed(&msg, remote, now),
                    Err(e) => report_bad_packet!(self.ctx, now, %remote, %e, "bad ConnectionClosed"),
                }
                None
            }
            // They don't think there's a connection on this address. We
            // agree; nothing to do.
            wire::MSG_NO_CONNECTION => None,
            // We never initiate, so we never expect these
            wire::MSG_CHALLENGE_REPLY | wire::MSG_CONNECT_OK => None,
            lead => {
                report_bad_packet!(self.ctx, now, %remote, lead, "invalid lead byte");
                None
            }
        }
    }

    /// Issue a stateless cookie; no memory of this exchange is kept
    fn received_challenge_request(
        &mut self,
        msg: &wire::ChallengeRequest,
        remote: SocketAddr,
        now: Microseconds,
    ) {
        if msg.connection_id == 0 {
            report_bad_packet!(self.ctx, now, %remote, "ChallengeRequest missing connection_id");
            return;
        }
        let challenge = self.challenge_key.generate(time_bucket(now), &remote);
        let reply = wire::ChallengeReply {
            connection_id: msg.connection_id,
            challenge,
            your_timestamp: msg.my_timestamp,
            protocol_version: PROTOCOL_VERSION,
        };
        self.send_msg(wire::MSG_CHALLENGE_REPLY, &reply, remote);
    }

    fn received_connect_request(
        &mut self,
        msg: &wire::ConnectRequest,
        remote: SocketAddr,
        packet_len: usize,
        now: Microseconds,
    ) -> Option<ListenerEvent> {
        // Cookie binds the source address to a recent time bucket; anything
        // else is stale or spoofed
        if !self.challenge_key.verify(now, msg.challenge, &remote) {
            report_bad_packet!(
                self.ctx,
                now,
                %remote,
                "ConnectRequest challenge is stale or incorrect, could be spoofed"
            );
            return None;
        }
        if msg.client_connection_id == 0 {
            report_bad_packet!(self.ctx, now, %remote, "ConnectRequest missing connection ID");
            return None;
        }
        let client_id = ConnectionId::new(msg.client_connection_id);

        let (identity, identity_in_cert) = match extract_remote_identity(
            &*self.crypto,
            msg.cert.as_deref(),
            msg.identity_string.as_deref(),
        ) {
            Ok(x) => x,
            Err(e) => {
                report_bad_packet!(self.ctx, now, %remote, %e, "bad identity in ConnectRequest");
                return None;
            }
        };
        let identity = match apply_address_identity_rules(
            identity,
            identity_in_cert,
            remote,
            self.connection_config.ip_allow_without_auth,
        ) {
            Ok(identity) => identity,
            Err(e) => {
                report_bad_packet!(self.ctx, now, %remote, e, "rejecting ConnectRequest");
                return None;
            }
        };

        // Same peer, same connection ID, different address: the existing
        // child stays; the newcomer is told to go away. (Same address would
        // have routed to the child directly.)
        if let Some(&existing) = self.by_peer.get(&(identity.clone(), client_id)) {
            let existing_addr = self.connections[existing.0].remote_address();
            debug_assert_ne!(existing_addr, remote);
            report_bad_packet!(
                self.ctx,
                now,
                %remote,
                %identity,
                id = %client_id,
                %existing_addr,
                "rejecting connect request: that identity/connection ID pair already has a connection"
            );
            let reply = wire::ConnectionClosed {
                to_connection_id: msg.client_connection_id,
                from_connection_id: 0,
                reason_code: EndReason::MiscGeneric.to_u32(),
                debug: "A connection with that ID already exists.".into(),
            };
            self.send_padded_msg(wire::MSG_CONNECTION_CLOSED, &reply, remote);
            return None;
        }

        let local_id = ConnectionId::random(&mut self.rng);
        let params = AcceptParams {
            config: self.connection_config.clone(),
            local_identity: self.local_identity.clone(),
            crypto: self.crypto.clone(),
            ctx: self.ctx.clone(),
            segments: Box::new(Discard),
            remote,
            remote_identity: identity.clone(),
            remote_id: client_id,
            local_id,
            cert: msg.cert.as_deref().unwrap_or(&[]),
            crypt: msg.crypt.as_deref().unwrap_or(&[]),
            ping_est_ms: msg.ping_est_ms,
            remote_timestamp: msg.my_timestamp,
            packet_len,
            now,
        };
        match Connection::new_accept(params) {
            Ok(conn) => {
                let ch = ConnectionHandle(self.connections.insert(conn));
                self.by_addr.insert(remote, ch);
                self.by_peer.insert((identity, client_id), ch);
                trace!(%remote, id = %local_id, "connection incoming");
                Some(ListenerEvent::Incoming(ch))
            }
            Err(e) => {
                warn!(%remote, %e, "failed to accept connection");
                None
            }
        }
    }

    /// Ack a teardown for a session we have no record of. The inbound message
    /// was required to be padded, and this reply is tiny, so there is no
    /// reflection risk even from a spoofed source.
    fn received_connection_closed(
        &mut self,
        msg: &wire::ConnectionClosed,
        remote: SocketAddr,
        _now: Microseconds,
    ) {
        let reply = wire::NoConnection {
            to_connection_id: msg.from_connection_id,
            from_connection_id: msg.to_connection_id,
        };
        self.send_msg(wire::MSG_NO_CONNECTION, &reply, remote);
    }

    /// Complete the handshake for a pending child, installing where its
    /// decrypted chunks will be delivered
    pub fn accept_connection(
        &mut self,
        now: Microseconds,
        ch: ConnectionHandle,
        segments: Box<dyn SegmentLayer>,
    ) {
        let conn = &mut self.connections[ch.0];
        conn.set_segment_layer(segments);
        conn.accept_application(now);
    }

    /// Refuse a pending child (or end an established one)
    pub fn close_connection(
        &mut self,
        now: Microseconds,
        ch: ConnectionHandle,
        reason: EndReason,
        debug: &str,
    ) {
        self.connections[ch.0].close(now, reason, debug);
    }

    /// Detach a child, dropping its routing entries. The connection is
    /// returned so the embedder can drain any final transmits.
    pub fn remove_connection(&mut self, ch: ConnectionHandle) -> Connection {
        let mut conn = self.connections.remove(ch.0);
        self.by_addr.remove(&conn.remote_address());
        if let (Some(identity), Some(remote_id)) =
            (conn.remote_identity().cloned(), conn.remote_connection_id())
        {
            self.by_peer.remove(&(identity, remote_id));
        }
        conn.mark_dead();
        conn
    }

    pub fn connection(&self, ch: ConnectionHandle) -> Option<&Connection> {
        self.connections.get(ch.0)
    }

    pub fn connection_mut(&mut self, ch: ConnectionHandle) -> Option<&mut Connection> {
        self.connections.get_mut(ch.0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Next datagram to put on the wire, from the listener itself or any child
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if let Some(transmit) = self.transmits.pop_front() {
            return Some(transmit);
        }
        for (_, conn) in self.connections.iter_mut() {
            if let Some(transmit) = conn.poll_transmit() {
                return Some(transmit);
            }
        }
        None
    }

    /// Earliest deadline among all children
    pub fn poll_timeout(&self) -> Option<Microseconds> {
        self.connections
            .iter()
            .filter_map(|(_, conn)| conn.poll_timeout())
            .min()
    }

    pub fn handle_timeout(&mut self, now: Microseconds) {
        for (_, conn) in self.connections.iter_mut() {
            conn.handle_timeout(now);
        }
    }

    fn send_msg<M: Message>(&mut self, tag: u8, msg: &M, destination: SocketAddr) {
        match packet::encode_plain_msg(tag, msg) {
            Ok(contents) => self.queue_transmit(contents, destination),
            Err(e) => debug_assert!(false, "{e}"),
        }
    }

    fn send_padded_msg<M: Message>(&mut self, tag: u8, msg: &M, destination: SocketAddr) {
        match packet::encode_padded_msg(tag, msg) {
            Ok(contents) => self.queue_transmit(contents, destination),
            Err(e) => debug_assert!(false, "{e}"),
        }
    }

    fn queue_transmit(&mut self, contents: Bytes, destination: SocketAddr) {
        self.transmits.push_back(Transmit {
            destination,
            contents,
        });
    }
}

impl Index<ConnectionHandle> for Listener {
    type Output = Connection;
    fn index(&self, ch: ConnectionHandle) -> &Connection {
        &self.connections[ch.0]
    }
}

impl IndexMut<ConnectionHandle> for Listener {
    fn index_mut(&mut self, ch: ConnectionHandle) -> &mut Connection {
        &mut self.connections[ch.0]
    }
}
