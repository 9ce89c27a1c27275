use std::sync::Arc;

use thiserror::Error;

use crate::crypto::{self, CryptoProvider};
use crate::{Identity, Microseconds, MIN_PADDED_PACKET_SIZE};

/// Parameters governing a single connection's wire behavior.
///
/// Applies to both sides; a listener stamps its copy onto every accepted
/// child.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Whether sessions without a signed certificate are allowed.
    ///
    /// 0 forbids them, 1 allows them with a warning, and 2 or more allows them
    /// silently. This gates both the anonymous localhost identity and unsigned
    /// certificates generally.
    pub ip_allow_without_auth: u32,

    /// How often handshake packets are retransmitted while connecting.
    ///
    /// A retry restarts from ChallengeRequest; the challenge a peer issues has
    /// a short expiry anyway.
    pub connect_retry_interval: Microseconds,

    /// How long the client-side handshake may run before the connection is
    /// abandoned with a timeout
    pub connect_timeout: Microseconds,

    /// Datagram payload budget for outgoing packets.
    ///
    /// Serialized inline stats are trimmed to respect this; the encrypted
    /// chunk itself never is.
    pub max_udp_payload: usize,

    /// How long a connection may be silent before we manufacture traffic to
    /// keep the path alive
    pub keepalive_interval: Microseconds,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ip_allow_without_auth: 0,
            connect_retry_interval: 1_000_000,
            connect_timeout: 10_000_000,
            max_udp_payload: crate::MAX_UDP_PAYLOAD,
            keepalive_interval: 10_000_000,
        }
    }
}

impl ConnectionConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_udp_payload < MIN_PADDED_PACKET_SIZE {
            return Err(ConfigError::IllegalValue(
                "max_udp_payload must fit a padded control message (512 bytes)",
            ));
        }
        if self.max_udp_payload > u16::MAX as usize {
            return Err(ConfigError::IllegalValue(
                "max_udp_payload must fit in a UDP datagram",
            ));
        }
        if self.connect_retry_interval <= 0 || self.connect_timeout <= 0 {
            return Err(ConfigError::IllegalValue(
                "handshake intervals must be positive",
            ));
        }
        if self.keepalive_interval <= 0 {
            return Err(ConfigError::IllegalValue(
                "keepalive_interval must be positive",
            ));
        }
        Ok(())
    }

    /// Unsigned-cert posture implied by `ip_allow_without_auth`
    pub(crate) fn unsigned_cert_policy(&self) -> crypto::UnsignedCertPolicy {
        match self.ip_allow_without_auth {
            0 => crypto::UnsignedCertPolicy::Disallow,
            1 => crypto::UnsignedCertPolicy::AllowWarn,
            _ => crypto::UnsignedCertPolicy::Allow,
        }
    }
}

/// Parameters for a listener accepting incoming connections
#[derive(Clone)]
pub struct ListenerConfig {
    /// Identity presented to connecting peers in ConnectOK
    pub local_identity: Identity,
    /// Certificate/crypt material source for accepted connections
    pub crypto: Arc<dyn CryptoProvider>,
    /// Per-connection defaults stamped onto accepted children
    pub connection: ConnectionConfig,
}

impl ListenerConfig {
    /// A listener using the built-in plaintext provider; suitable for tests
    /// and loopback-style deployments only.
    pub fn insecure(local_identity: Identity) -> Self {
        Self {
            crypto: Arc::new(crypto::plain::Provider::new(Some(local_identity.clone()), true)),
            local_identity,
            connection: ConnectionConfig::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()
    }
}

/// Parameters for initiating a connection
#[derive(Clone)]
pub struct ClientConfig {
    /// Identity presented to the server; [`Identity::LocalHost`] requires the
    /// server to permit unauthenticated sessions
    pub local_identity: Identity,
    /// Certificate/crypt material source for this connection
    pub crypto: Arc<dyn CryptoProvider>,
    pub connection: ConnectionConfig,
}

impl ClientConfig {
    /// A client using the built-in plaintext provider; suitable for tests and
    /// loopback-style deployments only.
    pub fn insecure(local_identity: Identity) -> Self {
        Self {
            crypto: Arc::new(crypto::plain::Provider::new(Some(local_identity.clone()), true)),
            local_identity,
            connection: ConnectionConfig::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()
    }
}

/// Errors in the parameters used to create an endpoint or connection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The supplied configuration contained an invalid value
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}
