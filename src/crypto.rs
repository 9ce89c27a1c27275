//! Traits abstracting certificate exchange and data-chunk encryption.
//!
//! The transport never interprets certificate, crypt-info, or chunk bytes
//! itself; it moves them between the wire and an implementation of these
//! traits. The [`plain`] provider implements the contract without any actual
//! cryptography for loopback pairs and tests.

use std::fmt;

use thiserror::Error;

use crate::{Identity, Side};

/// Whether a session may proceed without a signed certificate
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnsignedCertPolicy {
    /// Reject the handshake
    Disallow,
    /// Proceed, but emit a warning
    AllowWarn,
    /// Proceed silently
    Allow,
}

/// Source of certificate/crypt material and per-connection sessions
pub trait CryptoProvider: Send + Sync {
    /// Parse the identity a signed certificate asserts, if any.
    ///
    /// `Ok(None)` means the cert is absent or carries no identity; an error
    /// means the cert is malformed and the packet carrying it is dropped.
    fn identity_from_cert(&self, cert: &[u8]) -> Result<Option<Identity>, CryptoError>;

    /// Create the session state for one connection
    fn start_session(&self, side: Side) -> Box<dyn Session>;
}

/// Per-connection key agreement and chunk decryption
pub trait Session: Send {
    /// Signed certificate presented to the peer
    fn local_cert(&self) -> &[u8];

    /// Signed session crypt info presented to the peer
    fn local_crypt(&self) -> &[u8];

    /// Process the peer's certificate and crypt info.
    ///
    /// `accepting` is true on the server side of the handshake. Failure ends
    /// the connection with a bad-crypt reason.
    fn recv_handshake(
        &mut self,
        cert: &[u8],
        crypt: &[u8],
        accepting: bool,
        allow_unsigned: UnsignedCertPolicy,
    ) -> Result<(), CryptoError>;

    /// Authenticate and decrypt one data chunk.
    ///
    /// `wire_seq` is the truncated 16-bit sequence from the packet header; the
    /// session reconstructs and returns the full 64-bit sequence. `None`
    /// means the chunk must be dropped silently (bad tag, replay, etc).
    fn decrypt_data_chunk(
        &mut self,
        wire_seq: u16,
        cipher: &[u8],
        plain: &mut Vec<u8>,
    ) -> Option<u64>;
}

impl fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid certificate: {0}")]
    BadCert(String),
    #[error("unsigned certificate not allowed")]
    UnsignedCert,
    #[error("handshake failed: {0}")]
    Handshake(String),
}

pub mod plain {
    //! A provider with no cryptography at all.
    //!
    //! "Certificates" are the canonical identity string with a `signed;` or
    //! `unsigned;` prefix, chunks travel as plaintext, and "decryption" is
    //! just reconstruction of the full sequence number from its low 16 wire
    //! bits. Useful for loopback pairs and protocol tests; never for an
    //! untrusted network.

    use tracing::warn;

    use super::*;

    const CRYPT_INFO: &[u8] = b"plain-v1";

    pub struct Provider {
        identity: Option<Identity>,
        signed: bool,
    }

    impl Provider {
        /// `identity` is what certs from this provider assert; `signed`
        /// controls whether peers applying an unsigned-cert policy accept it.
        pub fn new(identity: Option<Identity>, signed: bool) -> Self {
            Self { identity, signed }
        }

        fn cert_bytes(&self) -> Vec<u8> {
            let Some(identity) = &self.identity else {
                return Vec::new();
            };
            let prefix = if self.signed { "signed;" } else { "unsigned;" };
            format!("{prefix}{identity}").into_bytes()
        }
    }

    fn parse_cert(cert: &[u8]) -> Result<Option<(Identity, bool)>, CryptoError> {
        if cert.is_empty() {
            return Ok(None);
        }
        let text = std::str::from_utf8(cert)
            .map_err(|_| CryptoError::BadCert("not utf-8".into()))?;
        let (signed, identity) = if let Some(rest) = text.strip_prefix("signed;") {
            (true, rest)
        } else if let Some(rest) = text.strip_prefix("unsigned;") {
            (false, rest)
        } else {
            return Err(CryptoError::BadCert("unrecognized framing".into()));
        };
        let identity = identity
            .parse::<Identity>()
            .map_err(|e| CryptoError::BadCert(e.to_string()))?;
        Ok(Some((identity, signed)))
    }

    impl CryptoProvider for Provider {
        fn identity_from_cert(&self, cert: &[u8]) -> Result<Option<Identity>, CryptoError> {
            Ok(parse_cert(cert)?.map(|(identity, _)| identity))
        }

        fn start_session(&self, _side: Side) -> Box<dyn Session> {
            Box::new(PlainSession {
                local_cert: self.cert_bytes(),
                highest_recv: 0,
            })
        }
    }

    pub struct PlainSession {
        local_cert: Vec<u8>,
        /// Highest full sequence number seen so far
        highest_recv: u64,
    }

    impl Session for PlainSession {
        fn local_cert(&self) -> &[u8] {
            &self.local_cert
        }

        fn local_crypt(&self) -> &[u8] {
            CRYPT_INFO
        }

        fn recv_handshake(
            &mut self,
            cert: &[u8],
            crypt: &[u8],
            _accepting: bool,
            allow_unsigned: UnsignedCertPolicy,
        ) -> Result<(), CryptoError> {
            if crypt != CRYPT_INFO {
                return Err(CryptoError::Handshake(
                    "unrecognized session crypt info".into(),
                ));
            }
            let signed = matches!(parse_cert(cert)?, Some((_, true)));
            if !signed {
                match allow_unsigned {
                    UnsignedCertPolicy::Disallow => return Err(CryptoError::UnsignedCert),
                    UnsignedCertPolicy::AllowWarn => {
                        warn!("allowing connection with unsigned certificate")
                    }
                    UnsignedCertPolicy::Allow => {}
                }
            }
            Ok(())
        }

        fn decrypt_data_chunk(
            &mut self,
            wire_seq: u16,
            cipher: &[u8],
            plain: &mut Vec<u8>,
        ) -> Option<u64> {
            let full = expand_wire_seq(self.highest_recv, wire_seq);
            if full == 0 {
                return None;
            }
            self.highest_recv = self.highest_recv.max(full);
            plain.clear();
            plain.extend_from_slice(cipher);
            Some(full)
        }
    }

    /// Reconstruct the full 64-bit sequence closest to the highest one seen
    fn expand_wire_seq(highest: u64, wire: u16) -> u64 {
        let expected = highest.wrapping_add(1);
        let candidate = (expected & !0xffff) | u64::from(wire);
        let window = 1u64 << 16;
        if candidate.wrapping_add(window / 2) < expected {
            candidate + window
        } else if candidate >= expected.wrapping_add(window / 2) && candidate >= window {
            candidate - window
        } else {
            candidate
        }
    }

}
