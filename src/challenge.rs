//! Stateless anti-spoofing cookies for the connect handshake.
//!
//! The listener never remembers an outstanding cookie. Each one is a keyed
//! MAC binding the requester's address to a coarse time bucket; returning it
//! proves the requester can receive at the address it claimed. Freshness
//! comes entirely from the bucket window, the secret only rotates on restart.

use std::hash::Hasher;
use std::net::{IpAddr, SocketAddr};

use rand::RngCore;
use siphasher::sip::SipHasher24;

use crate::Microseconds;

/// Cookies older than this are rejected
const CHALLENGE_WINDOW: Microseconds = 4_000_000;

/// Each bucket is 2^20 µs ≈ 1.05 s
pub(crate) fn time_bucket(usec: Microseconds) -> u16 {
    (usec >> 20) as u16
}

/// The listener's challenge secret, generated at bind time and never exposed
pub(crate) struct ChallengeKey {
    secret: [u8; 16],
}

impl ChallengeKey {
    pub fn new<R: RngCore>(rng: &mut R) -> Self {
        let mut secret = [0; 16];
        rng.fill_bytes(&mut secret);
        Self { secret }
    }

    /// Cookie for `addr` at time bucket `bucket`: the truncated MAC in the
    /// high 48 bits, the bucket itself in the low 16.
    pub fn generate(&self, bucket: u16, addr: &SocketAddr) -> u64 {
        let mut input = [0; 20];
        input[0..2].copy_from_slice(&bucket.to_le_bytes());
        input[2..4].copy_from_slice(&addr.port().to_le_bytes());
        input[4..20].copy_from_slice(&ipv6_octets(addr.ip()));
        let mut hasher = SipHasher24::new_with_key(&self.secret);
        hasher.write(&input);
        (hasher.finish() & 0xffff_ffff_ffff_0000) | u64::from(bucket)
    }

    /// Check a returned cookie against the packet's actual source address
    pub fn verify(&self, now: Microseconds, challenge: u64, addr: &SocketAddr) -> bool {
        let then = challenge as u16;
        let elapsed = time_bucket(now).wrapping_sub(then);
        if elapsed > time_bucket(CHALLENGE_WINDOW) {
            return false;
        }
        self.generate(then, addr) == challenge
    }
}

/// Addresses are hashed in their 16-byte IPv6 form; IPv4 maps in
fn ipv6_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}
