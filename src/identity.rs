use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

/// Who a peer claims to be.
///
/// Identities are compared and hashed structurally: they key the listener's
/// child-connection table together with the remote connection ID. The
/// canonical string form below is also the wire encoding used when a
/// certificate does not assert the identity itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// The anonymous, unauthenticated identity
    LocalHost,
    /// An application-level numeric account ID
    Numeric(u64),
    /// An IP address and port, either cert-asserted or observed
    Address(SocketAddr),
    /// A free-form name
    Named(String),
}

impl Identity {
    pub fn is_localhost(&self) -> bool {
        matches!(self, Identity::LocalHost)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::LocalHost => write!(f, "localhost"),
            Identity::Numeric(id) => write!(f, "id:{id}"),
            Identity::Address(addr) => write!(f, "ip:{addr}"),
            Identity::Named(name) => write!(f, "str:{name}"),
        }
    }
}

/// Errors from parsing the canonical string form of an [`Identity`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityParseError {
    #[error("unknown identity format")]
    UnknownFormat,
    #[error("malformed numeric identity")]
    BadNumeric,
    #[error("malformed address identity")]
    BadAddress,
    #[error("empty name identity")]
    EmptyName,
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "localhost" {
            return Ok(Identity::LocalHost);
        }
        if let Some(rest) = s.strip_prefix("id:") {
            let id = rest
                .parse::<u64>()
                .map_err(|_| IdentityParseError::BadNumeric)?;
            return Ok(Identity::Numeric(id));
        }
        if let Some(rest) = s.strip_prefix("ip:") {
            let addr = rest
                .parse::<SocketAddr>()
                .map_err(|_| IdentityParseError::BadAddress)?;
            return Ok(Identity::Address(addr));
        }
        if let Some(rest) = s.strip_prefix("str:") {
            if rest.is_empty() {
                return Err(IdentityParseError::EmptyName);
            }
            return Ok(Identity::Named(rest.into()));
        }
        Err(IdentityParseError::UnknownFormat)
    }
}
