//! In-process connection pairs that skip the wire entirely.
//!
//! Both ends live in the same process, so there is nothing to prove with a
//! cookie handshake and nothing to encrypt: sends are plaintext pushed
//! straight onto the peer's inbound queue, popped by
//! [`Connection::drive_loopback`].

use std::collections::VecDeque;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use crate::connection::{Connection, EndReason};
use crate::crypto::{CryptoError, CryptoProvider, Session, UnsignedCertPolicy};
use crate::segment::SegmentLayer;
use crate::{
    ConfigError, ConnectionConfig, ConnectionId, Identity, Microseconds, Side, TransportContext,
};

/// What travels between loopback peers instead of datagrams
pub(crate) enum LoopbackItem {
    Chunk {
        seq: u64,
        data: Bytes,
    },
    Closed {
        reason: EndReason,
        debug: String,
    },
}

type Queue = Arc<Mutex<VecDeque<LoopbackItem>>>;

/// One side's view of the shared queue pair
pub(crate) struct LoopbackIo {
    inbound: Queue,
    outbound: Queue,
}

impl LoopbackIo {
    fn pair() -> (Self, Self) {
        let a: Queue = Arc::default();
        let b: Queue = Arc::default();
        (
            Self {
                inbound: a.clone(),
                outbound: b.clone(),
            },
            Self {
                inbound: b,
                outbound: a,
            },
        )
    }

    pub fn pop_inbound(&self) -> Option<LoopbackItem> {
        self.inbound.lock().unwrap().pop_front()
    }

    pub fn push_outbound(&self, item: LoopbackItem) {
        self.outbound.lock().unwrap().push_back(item);
    }

    /// Loopback connections still need *some* peer address for diagnostics
    pub fn fake_addr(&self) -> SocketAddr {
        SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 1)
    }
}

#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("crypto handshake failed creating loopback pair: {0}")]
    Crypto(#[from] CryptoError),
}

/// Create two already-connected ends of an in-process session.
///
/// `identities[i]` becomes the *remote* identity seen by `conn[i]`; the pair
/// comes up `Connected` at the same timestamp with connection IDs
/// cross-linked, and neither end surfaces the initial state-change events.
/// Unsigned certificates are always acceptable here: both ends are us.
pub fn new_loopback_pair(
    config: &ConnectionConfig,
    identities: [Identity; 2],
    crypto: &Arc<dyn CryptoProvider>,
    segments: [Box<dyn SegmentLayer>; 2],
    ctx: &Arc<TransportContext>,
    now: Microseconds,
) -> Result<[Connection; 2], LoopbackError> {
    config.validate()?;

    let mut rng = StdRng::from_entropy();
    let ids = [
        ConnectionId::random(&mut rng),
        ConnectionId::random(&mut rng),
    ];

    let mut sessions = [
        crypto.start_session(Side::Server),
        crypto.start_session(Side::Client),
    ];
    let certs = [
        sessions[0].local_cert().to_vec(),
        sessions[1].local_cert().to_vec(),
    ];
    let crypts = [
        sessions[0].local_crypt().to_vec(),
        sessions[1].local_crypt().to_vec(),
    ];
    for (i, session) in sessions.iter_mut().enumerate() {
        session.recv_handshake(
            &certs[1 - i],
            &crypts[1 - i],
            i == 0,
            UnsignedCertPolicy::Allow,
        )?;
    }

    let (io_a, io_b) = LoopbackIo::pair();
    let [session_a, session_b] = sessions;
    let [segments_a, segments_b] = segments;
    let config = Arc::new(config.clone());

    // Local identities are deliberately swapped so that identities[i] is what
    // conn[i] observes as its peer
    let conn_a = Connection::new_loopback(
        config.clone(),
        identities[1].clone(),
        identities[0].clone(),
        ids[0],
        ids[1],
        crypto.clone(),
        session_a,
        segments_a,
        ctx.clone(),
        io_a,
        now,
    );
    let conn_b = Connection::new_loopback(
        config,
        identities[0].clone(),
        identities[1].clone(),
        ids[1],
        ids[0],
        crypto.clone(),
        session_b,
        segments_b,
        ctx.clone(),
        io_b,
        now,
    );
    Ok([conn_a, conn_b])
}
