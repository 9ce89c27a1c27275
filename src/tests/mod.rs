use std::net::SocketAddr;
use std::sync::Arc;

use assert_matches::assert_matches;
use bytes::{Bytes, BytesMut};

use crate::crypto::{plain, CryptoProvider};
use crate::packet::{self, DataHeader, DATA_HEADER_SIZE, DATA_PACKET_BIT};
use crate::segment::ChunkQueue;
use crate::wire;
use crate::*;

mod util;
use util::*;

#[test]
fn handshake_happy_path() {
    let _guard = subscribe();
    let mut pair = default_pair();
    let ch = pair.connect(client_config("alice"));

    // IDs latched crosswise
    let client_local = pair.client_conn().local_connection_id();
    let server_local = pair.server.listener[ch].local_connection_id();
    assert_eq!(
        pair.client_conn().remote_connection_id(),
        Some(server_local)
    );
    assert_eq!(
        pair.server.listener[ch].remote_connection_id(),
        Some(client_local)
    );
    assert_eq!(
        pair.server.listener[ch].remote_identity(),
        Some(&Identity::Named("alice".into()))
    );
    assert_eq!(
        pair.client_conn().remote_identity(),
        Some(&Identity::Named("server".into()))
    );
    assert_matches!(pair.server.listener[ch].poll(), Some(Event::Connected));

    // Exactly one round trip after the cookie exchange: four packets total
    let client_tags: Vec<u8> = pair.client.sent.iter().map(|t| t.contents[0]).collect();
    assert_eq!(
        client_tags,
        vec![wire::MSG_CHALLENGE_REQUEST, wire::MSG_CONNECT_REQUEST]
    );
    let server_tags: Vec<u8> = pair.server.sent.iter().map(|t| t.contents[0]).collect();
    assert_eq!(server_tags, vec![wire::MSG_CHALLENGE_REPLY, wire::MSG_CONNECT_OK]);

    // Both sides took a ping sample from the timestamp echoes
    assert!(pair.client_conn().stats().smoothed_ping_ms().is_some());
    assert!(pair.server.listener[ch].stats().smoothed_ping_ms().is_some());
    assert_eq!(
        pair.client_conn().stats().peer_protocol_version(),
        PROTOCOL_VERSION
    );
    assert_eq!(
        pair.server.listener[ch].description(),
        format!("UDP str:alice@{}", pair.client.addr)
    );
}

#[test]
fn challenge_request_is_padded_and_reply_is_smaller() {
    let mut pair = default_pair();
    pair.begin_connect(client_config("alice"));
    pair.drive();

    let request = &pair.client.sent[0];
    assert_eq!(request.contents[0], wire::MSG_CHALLENGE_REQUEST);
    assert!(request.contents.len() >= 512);
    // Zero padding, not process memory
    let body_len = u16::from_le_bytes(request.contents[1..3].try_into().unwrap()) as usize;
    assert!(request.contents[3 + body_len..].iter().all(|&b| b == 0));

    // No amplification: the stateless reply never exceeds what came in
    let reply = &pair.server.sent[0];
    assert_eq!(reply.contents[0], wire::MSG_CHALLENGE_REPLY);
    assert!(reply.contents.len() <= request.contents.len());
}

#[test]
fn spoofed_connect_request_creates_no_state() {
    let mut pair = default_pair();
    let attacker: SocketAddr = "[2001:db8::bad]:6666".parse().unwrap();
    let msg = wire::ConnectRequest {
        client_connection_id: 0xaaaa0001,
        challenge: 0,
        identity_string: Some("str:mallory".into()),
        protocol_version: PROTOCOL_VERSION,
        ..Default::default()
    };
    let pkt = packet::encode_plain_msg(wire::MSG_CONNECT_REQUEST, &msg).unwrap();
    pair.send_to_server(attacker, pkt);
    pair.drive();

    assert!(pair.server.events.is_empty());
    assert_eq!(pair.server.listener.connection_count(), 0);
    assert!(pair.server.sent.is_empty());
}

#[test]
fn stale_challenge_is_rejected() {
    let mut pair = default_pair();
    let client: SocketAddr = "[2001:db8::77]:7777".parse().unwrap();

    let request = wire::ChallengeRequest {
        connection_id: 0xaaaa0001,
        my_timestamp: Some(pair.time as u64),
        protocol_version: PROTOCOL_VERSION,
    };
    let pkt = packet::encode_padded_msg(wire::MSG_CHALLENGE_REQUEST, &request).unwrap();
    pair.send_to_server(client, pkt);
    pair.drive();

    let reply: wire::ChallengeReply =
        packet::decode_plain_msg(&pair.server.sent[0].contents).unwrap();

    // Replay the challenge well past its window
    pair.advance(10_000_000);
    let connect = wire::ConnectRequest {
        client_connection_id: 0xaaaa0001,
        challenge: reply.challenge,
        identity_string: Some("str:mallory".into()),
        crypt: Some(b"plain-v1".to_vec()),
        protocol_version: PROTOCOL_VERSION,
        ..Default::default()
    };
    let pkt = packet::encode_plain_msg(wire::MSG_CONNECT_REQUEST, &connect).unwrap();
    pair.send_to_server(client, pkt);
    pair.drive();

    assert!(pair.server.events.is_empty());
    assert_eq!(pair.server.listener.connection_count(), 0);
}

#[test]
fn duplicate_session_is_rejected_without_displacing_the_first() {
    let mut pair = default_pair();
    let ch = pair.connect(client_config("alice"));
    let client_id = pair.client_conn().local_connection_id();

    // Same identity and connection ID, different source address
    let second_addr: SocketAddr = "[2001:db8::2]:27016".parse().unwrap();
    let request = wire::ChallengeRequest {
        connection_id: client_id.to_u32(),
        my_timestamp: None,
        protocol_version: PROTOCOL_VERSION,
    };
    let pkt = packet::encode_padded_msg(wire::MSG_CHALLENGE_REQUEST, &request).unwrap();
    pair.send_to_server(second_addr, pkt);
    pair.drive();
    let reply: wire::ChallengeReply = packet::decode_plain_msg(
        &pair
            .server
            .sent
            .iter()
            .rev()
            .find(|t| t.destination == second_addr)
            .unwrap()
            .contents,
    )
    .unwrap();

    let connect = wire::ConnectRequest {
        client_connection_id: client_id.to_u32(),
        challenge: reply.challenge,
        cert: Some(b"signed;str:alice".to_vec()),
        crypt: Some(b"plain-v1".to_vec()),
        protocol_version: PROTOCOL_VERSION,
        ..Default::default()
    };
    let inbound = packet::encode_plain_msg(wire::MSG_CONNECT_REQUEST, &connect).unwrap();
    pair.send_to_server(second_addr, inbound);
    pair.drive();

    // The newcomer gets a padded ConnectionClosed; the original is untouched
    let closed = pair
        .server
        .sent
        .iter()
        .rev()
        .find(|t| t.destination == second_addr)
        .unwrap();
    assert_eq!(closed.contents[0], wire::MSG_CONNECTION_CLOSED);
    assert!(closed.contents.len() >= 512);
    let msg: wire::ConnectionClosed = packet::decode_padded_msg(&closed.contents).unwrap();
    assert_eq!(msg.to_connection_id, client_id.to_u32());
    assert_eq!(msg.reason_code, EndReason::MiscGeneric.to_u32());

    assert!(pair.server.events.is_empty());
    assert_eq!(pair.server.listener.connection_count(), 1);
    assert_eq!(pair.server.listener[ch].state(), State::Connected);
}

#[test]
fn stray_data_is_dropped_without_reply() {
    let mut pair = default_pair();
    let attacker: SocketAddr = "[2001:db8::5]:5555".parse().unwrap();

    let mut pkt = BytesMut::new();
    DataHeader {
        flags: DATA_PACKET_BIT,
        to_connection_id: 0xdead,
        wire_seq: 1,
    }
    .encode(&mut pkt);
    pkt.extend_from_slice(b"junk");
    pair.send_to_server(attacker, pkt.freeze());

    // Legacy connectionless probe: also dropped, not even logged
    pair.send_to_server(attacker, Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0x00]));
    pair.drive();

    assert!(pair.server.sent.is_empty());
    assert!(pair.server.events.is_empty());
    assert_eq!(pair.server.listener.connection_count(), 0);
}

#[test]
fn wrong_connection_id_data_never_reaches_decrypt() {
    let mut pair = default_pair();
    let ch = pair.connect(client_config("alice"));
    let good_id = pair.server.listener[ch].local_connection_id();

    let mut pkt = BytesMut::new();
    DataHeader {
        flags: DATA_PACKET_BIT,
        to_connection_id: good_id.to_u32() ^ 1,
        wire_seq: 1,
    }
    .encode(&mut pkt);
    pkt.extend_from_slice(b"bogus");
    let pkt = pkt.freeze();

    let sent_before = pair.server.sent.len();
    pair.send_to_server(pair.client.addr, pkt.clone());
    pair.drive();

    // One rate-limited NoConnection naming the bogus ID, nothing delivered
    let replies: Vec<_> = pair.server.sent[sent_before..]
        .iter()
        .filter(|t| t.contents[0] == wire::MSG_NO_CONNECTION)
        .collect();
    assert_eq!(replies.len(), 1);
    let msg: wire::NoConnection = packet::decode_plain_msg(&replies[0].contents).unwrap();
    assert_eq!(msg.from_connection_id, good_id.to_u32() ^ 1);
    assert_eq!(msg.to_connection_id, 0);
    assert!(pair.server.chunks.as_ref().unwrap().is_empty());
    assert_eq!(pair.server.listener[ch].state(), State::Connected);

    // Under flood, the reply rate is bounded
    pair.send_to_server(pair.client.addr, pkt.clone());
    pair.send_to_server(pair.client.addr, pkt);
    pair.drive();
    let replies = pair.server.sent[sent_before..]
        .iter()
        .filter(|t| t.contents[0] == wire::MSG_NO_CONNECTION)
        .count();
    assert_eq!(replies, 1);
}

#[test]
fn data_round_trip_with_monotonic_sequences() {
    let mut pair = default_pair();
    pair.connect(client_config("alice"));

    let payloads: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 32 + i as usize]).collect();
    for payload in &payloads {
        let now = pair.time;
        pair.client_conn()
            .send_encrypted_data_chunk(payload, now)
            .unwrap();
    }
    pair.drive();

    // Wire sequences strictly increase
    let wire_seqs: Vec<u16> = pair
        .client
        .sent
        .iter()
        .filter(|t| packet::is_data_packet(t.contents[0]))
        .map(|t| DataHeader::decode(&t.contents).unwrap().0.wire_seq)
        .collect();
    assert_eq!(wire_seqs, vec![1, 2, 3, 4, 5]);
    assert_eq!(pair.client_conn().stats().send_sequence(), 6);

    // Full sequences reconstructed in order, chunks intact
    let chunks = pair.server.chunks.as_ref().unwrap();
    for (i, payload) in payloads.iter().enumerate() {
        let (seq, data) = chunks.pop().unwrap();
        assert_eq!(seq, i as u64 + 1);
        assert_eq!(&data[..], &payload[..]);
    }
    assert!(chunks.is_empty());

    // Idle long enough and both sides manufacture keepalive traffic
    pair.advance(10_000_000);
    let keepalive = pair.server.sent.iter().any(|t| {
        packet::is_data_packet(t.contents[0]) && t.destination == pair.client.addr
    });
    assert!(keepalive, "server never sent a keepalive packet");
}

#[test]
fn immediate_ack_request_gets_an_immediate_reply() {
    let mut pair = default_pair();
    pair.connect(client_config("alice"));
    let server_sent = pair.server.sent.len();

    let now = pair.time;
    pair.client_conn().send_stats_now(now, ReplyRequest::Immediate);
    pair.drive();

    // The probe carries the immediate-ack bits
    let probe = pair
        .client
        .sent
        .iter()
        .rev()
        .find(|t| packet::is_data_packet(t.contents[0]))
        .unwrap();
    let (header, rest) = DataHeader::decode(&probe.contents).unwrap();
    assert_ne!(header.flags & packet::FLAG_PROTOBUF_BLOB, 0);
    let mut cursor = rest;
    let len = prost::encoding::decode_varint(&mut cursor).unwrap() as usize;
    let stats = <wire::Stats as prost::Message>::decode(&cursor[..len]).unwrap();
    assert_ne!(stats.flags & wire::Stats::ACK_REQUEST_E2E, 0);
    assert_ne!(stats.flags & wire::Stats::ACK_REQUEST_IMMEDIATE, 0);

    // And the server acks without waiting for a timer
    let ack = pair.server.sent[server_sent..]
        .iter()
        .find(|t| packet::is_data_packet(t.contents[0]))
        .expect("server did not ack immediately");
    let (header, rest) = DataHeader::decode(&ack.contents).unwrap();
    assert_ne!(header.flags & packet::FLAG_PROTOBUF_BLOB, 0);
    let mut cursor = rest;
    let len = prost::encoding::decode_varint(&mut cursor).unwrap() as usize;
    let stats = <wire::Stats as prost::Message>::decode(&cursor[..len]).unwrap();
    assert!(stats.ack_seq.is_some());
}

#[test]
fn peer_initiated_close_is_acked_each_receipt() {
    let mut pair = default_pair();
    let ch = pair.connect(client_config("alice"));
    let client_id = pair.client_conn().local_connection_id();
    let server_id = pair.server.listener[ch].local_connection_id();

    pair.server
        .listener
        .close_connection(pair.time, ch, EndReason::App, "bye");
    pair.drive();

    let closed_pkt = pair
        .server
        .sent
        .iter()
        .find(|t| t.contents[0] == wire::MSG_CONNECTION_CLOSED)
        .unwrap()
        .contents
        .clone();
    assert!(closed_pkt.len() >= 512);

    assert_eq!(pair.client_conn().state(), State::ClosedByPeer);
    assert_matches!(
        pair.client_conn().poll(),
        Some(Event::Closed { reason: EndReason::App, debug }) if debug == "bye"
    );

    // Exactly one ack, echoing the IDs
    let acks: Vec<_> = pair
        .client
        .sent
        .iter()
        .filter(|t| t.contents[0] == wire::MSG_NO_CONNECTION)
        .collect();
    assert_eq!(acks.len(), 1);
    let ack: wire::NoConnection = packet::decode_plain_msg(&acks[0].contents).unwrap();
    assert_eq!(ack.from_connection_id, client_id.to_u32());
    assert_eq!(ack.to_connection_id, server_id.to_u32());

    // A retransmitted ConnectionClosed earns one more ack and no new event
    pair.send_to_client(closed_pkt);
    pair.drive();
    let acks = pair
        .client
        .sent
        .iter()
        .filter(|t| t.contents[0] == wire::MSG_NO_CONNECTION)
        .count();
    assert_eq!(acks, 2);
    assert_eq!(pair.client_conn().poll(), None);
}

#[test]
fn listener_acks_teardown_for_unknown_sessions() {
    let mut pair = default_pair();
    let stranger: SocketAddr = "[2001:db8::abc]:1000".parse().unwrap();
    let msg = wire::ConnectionClosed {
        from_connection_id: 0xaa001111,
        to_connection_id: 0xbb002222,
        reason_code: EndReason::App.to_u32(),
        debug: "late teardown".into(),
    };
    let inbound = packet::encode_padded_msg(wire::MSG_CONNECTION_CLOSED, &msg).unwrap();
    let inbound_len = inbound.len();
    pair.send_to_server(stranger, inbound);
    pair.drive();

    let reply = &pair.server.sent[0];
    assert_eq!(reply.destination, stranger);
    assert_eq!(reply.contents[0], wire::MSG_NO_CONNECTION);
    assert!(reply.contents.len() <= inbound_len);
    let ack: wire::NoConnection = packet::decode_plain_msg(&reply.contents).unwrap();
    // Echoed exactly: their "from" is our "to" and vice versa
    assert_eq!(ack.to_connection_id, 0xaa001111);
    assert_eq!(ack.from_connection_id, 0xbb002222);
    assert_eq!(pair.server.listener.connection_count(), 0);
}

#[test]
fn resends_connect_ok_when_handshake_repeats_after_accept() {
    let mut pair = default_pair();
    pair.connect(client_config("alice"));

    let connect_request = pair
        .client
        .sent
        .iter()
        .find(|t| t.contents[0] == wire::MSG_CONNECT_REQUEST)
        .unwrap()
        .contents
        .clone();

    // Pretend our ConnectOK was lost and the client is retrying
    pair.send_to_server(pair.client.addr, connect_request);
    pair.drive();

    let oks = pair
        .server
        .sent
        .iter()
        .filter(|t| t.contents[0] == wire::MSG_CONNECT_OK)
        .count();
    assert_eq!(oks, 2);
    assert_eq!(pair.client_conn().state(), State::Connected);
}

#[test]
fn handshake_retries_then_times_out() {
    let mut pair = default_pair();
    pair.drop_to_server = true;
    pair.begin_connect(client_config("alice"));
    pair.drive();
    assert_eq!(pair.client.sent.len(), 1);

    pair.advance(1_000_000);
    assert_eq!(pair.client.sent.len(), 2);
    assert_eq!(pair.client.sent[1].contents[0], wire::MSG_CHALLENGE_REQUEST);
    assert!(pair.client.sent[1].contents.len() >= 512);

    for _ in 0..9 {
        pair.advance(1_000_000);
    }
    assert_eq!(pair.client_conn().state(), State::ProblemDetectedLocally);
    assert_matches!(
        pair.client_conn().poll(),
        Some(Event::Closed { reason: EndReason::MiscTimeout, .. })
    );
    // The teardown notice goes out padded
    let last = pair.client.sent.last().unwrap();
    assert_eq!(last.contents[0], wire::MSG_CONNECTION_CLOSED);
    assert!(last.contents.len() >= 512);
}

#[test]
fn old_peer_protocol_version_ends_the_connection() {
    let mut pair = default_pair();
    pair.drop_to_server = true;
    pair.begin_connect(client_config("alice"));
    pair.drive();

    let local_id = pair.client_conn().local_connection_id();
    let reply = wire::ChallengeReply {
        connection_id: local_id.to_u32(),
        challenge: 0x1234,
        your_timestamp: None,
        protocol_version: 0,
    };
    let pkt = packet::encode_plain_msg(wire::MSG_CHALLENGE_REPLY, &reply).unwrap();
    pair.send_to_client(pkt);
    pair.drive();

    assert_eq!(pair.client_conn().state(), State::ProblemDetectedLocally);
    assert_matches!(
        pair.client_conn().poll(),
        Some(Event::Closed { reason: EndReason::MiscGeneric, debug })
            if debug.contains("old software")
    );
}

#[test]
fn challenge_reply_with_wrong_id_is_ignored() {
    let mut pair = default_pair();
    pair.drop_to_server = true;
    pair.begin_connect(client_config("alice"));
    pair.drive();

    let local_id = pair.client_conn().local_connection_id();
    let reply = wire::ChallengeReply {
        connection_id: local_id.to_u32() ^ 0xf0f0,
        challenge: 0x1234,
        your_timestamp: None,
        protocol_version: PROTOCOL_VERSION,
    };
    let pkt = packet::encode_plain_msg(wire::MSG_CHALLENGE_REPLY, &reply).unwrap();
    pair.send_to_client(pkt);
    pair.drive();

    assert_eq!(pair.client_conn().state(), State::Connecting);
    assert!(!pair
        .client
        .sent
        .iter()
        .any(|t| t.contents[0] == wire::MSG_CONNECT_REQUEST));
}

#[test]
fn anonymous_clients_need_server_permission() {
    // Default configuration forbids unauthenticated sessions
    let mut pair = Pair::new(server_config("server"));
    pair.begin_connect(anonymous_client_config());
    pair.drive();
    assert!(pair.server.events.is_empty());
    assert_eq!(pair.server.listener.connection_count(), 0);

    // Explicitly permitted: the identity becomes the observed address
    let mut config = server_config("server");
    config.connection.ip_allow_without_auth = 2;
    let mut pair = Pair::new(config);
    pair.begin_connect(anonymous_client_config());
    pair.drive();
    let ch = pair.server.assert_incoming();
    pair.accept(ch);
    pair.drive();

    assert_eq!(pair.client_conn().state(), State::Connected);
    assert_eq!(pair.server.listener[ch].state(), State::Connected);
    assert_eq!(
        pair.server.listener[ch].remote_identity(),
        Some(&Identity::Address(pair.client.addr))
    );
}

#[test]
fn oversized_stats_are_trimmed_never_the_chunk() {
    let mut pair = default_pair();
    pair.connect(client_config("alice"));

    // Make opportunistic stats pending without firing the think timer
    pair.time += 10_000_000;
    let now = pair.time;
    let max = pair.client_conn().max_encrypted_payload(0);
    let chunk = vec![0x5a; max];
    let sent = pair
        .client_conn()
        .send_encrypted_data_chunk(&chunk, now)
        .unwrap();
    assert_eq!(sent, DATA_HEADER_SIZE + chunk.len());
    pair.drive();

    let transmit = pair
        .client
        .sent
        .iter()
        .rev()
        .find(|t| packet::is_data_packet(t.contents[0]))
        .unwrap();
    let (header, rest) = DataHeader::decode(&transmit.contents).unwrap();
    // The blob was dropped wholesale; the chunk arrived untouched
    assert_eq!(header.flags, DATA_PACKET_BIT);
    assert_eq!(rest.len(), chunk.len());
    let (seq, data) = pair.server.chunks.as_ref().unwrap().pop().unwrap();
    assert_eq!(seq, 1);
    assert_eq!(&data[..], &chunk[..]);
}

#[test]
fn strays_for_recently_removed_connections_stay_quiet() {
    let mut pair = default_pair();
    let ch = pair.connect(client_config("alice"));
    let server_id = pair.server.listener[ch].local_connection_id();

    let removed = pair.server.listener.remove_connection(ch);
    assert_eq!(removed.state(), State::Dead);
    assert_eq!(pair.server.listener.connection_count(), 0);

    // A late data packet for the dead session: no reply, no new state
    let sent_before = pair.server.sent.len();
    let mut pkt = BytesMut::new();
    DataHeader {
        flags: DATA_PACKET_BIT,
        to_connection_id: server_id.to_u32(),
        wire_seq: 99,
    }
    .encode(&mut pkt);
    pkt.extend_from_slice(b"late");
    pair.send_to_server(pair.client.addr, pkt.freeze());
    pair.drive();

    assert_eq!(pair.server.sent.len(), sent_before);
    assert!(pair.server.events.is_empty());
    assert_eq!(pair.server.listener.connection_count(), 0);
}

#[test]
fn linger_ignores_inbound_data() {
    let mut pair = default_pair();
    let ch = pair.connect(client_config("alice"));
    let now = pair.time;
    pair.client_conn().linger(now);
    assert_eq!(pair.client_conn().state(), State::Linger);

    let server_conn = pair.server.listener.connection_mut(ch).unwrap();
    server_conn.send_encrypted_data_chunk(b"ignored", now).unwrap();
    pair.drive();

    assert!(pair.client.chunks.as_ref().unwrap().is_empty());
    assert_eq!(pair.client_conn().state(), State::Linger);
}

#[test]
fn loopback_pair_short_circuits_the_wire() {
    let identities = [
        Identity::Named("left".into()),
        Identity::Named("right".into()),
    ];
    let crypto: Arc<dyn CryptoProvider> = Arc::new(plain::Provider::new(None, false));
    let ctx = Arc::new(TransportContext::new());
    let (queue_a, chunks_a) = ChunkQueue::new();
    let (queue_b, chunks_b) = ChunkQueue::new();
    let now = 1_000_000;
    let [mut a, mut b] = new_loopback_pair(
        &ConnectionConfig::default(),
        identities.clone(),
        &crypto,
        [Box::new(queue_a), Box::new(queue_b)],
        &ctx,
        now,
    )
    .unwrap();

    // Born connected, with identities cross-linked and no initial events
    assert_eq!(a.state(), State::Connected);
    assert_eq!(b.state(), State::Connected);
    assert_eq!(a.remote_identity(), Some(&identities[0]));
    assert_eq!(b.remote_identity(), Some(&identities[1]));
    assert_eq!(a.remote_connection_id(), Some(b.local_connection_id()));
    assert_eq!(b.remote_connection_id(), Some(a.local_connection_id()));
    assert_eq!(a.poll(), None);
    assert_eq!(b.poll(), None);

    // Plaintext crosses without any wire encoding
    a.send_encrypted_data_chunk(b"hello over loopback", now).unwrap();
    b.drive_loopback(now);
    assert_eq!(
        chunks_b.pop().unwrap(),
        (1, Bytes::from_static(b"hello over loopback"))
    );
    assert!(a.poll_transmit().is_none());
    assert!(b.poll_transmit().is_none());

    b.send_encrypted_data_chunk(b"reply", now).unwrap();
    a.drive_loopback(now);
    assert_eq!(chunks_a.pop().unwrap(), (1, Bytes::from_static(b"reply")));

    // Downstream transitions still surface normally
    a.close(now, EndReason::App, "done");
    assert_matches!(a.poll(), Some(Event::Closed { reason: EndReason::App, .. }));
    b.drive_loopback(now);
    assert_eq!(b.state(), State::ClosedByPeer);
    assert_matches!(
        b.poll(),
        Some(Event::Closed { reason: EndReason::App, debug }) if debug == "done"
    );
}

#[test]
fn connect_rejects_anonymous_identity_when_auth_required() {
    let ctx = Arc::new(TransportContext::new());
    let config = ClientConfig {
        local_identity: Identity::LocalHost,
        crypto: Arc::new(plain::Provider::new(None, false)),
        connection: ConnectionConfig::default(), // ip_allow_without_auth: 0
    };
    let (queue, _handle) = ChunkQueue::new();
    let result = Connection::connect(
        config,
        "[::1]:4433".parse().unwrap(),
        Box::new(queue),
        ctx,
        0,
    );
    assert_matches!(result, Err(ConnectError::AuthRequired));
}
