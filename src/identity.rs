// identity.rs - peer identities and the remote connection key
// Numan Thabit 2025

use std::{fmt, net::SocketAddr, str::FromStr};

use thiserror::Error;

/// Who a peer claims to be.
///
/// `LocalHost` is the anonymous sentinel: a peer that presents no identity at
/// all.  During connection acceptance it is rewritten to the peer's observed
/// address, so an `IpAddress` identity equal to the true source address is
/// the canonical "no real identity" form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// The anonymous sentinel.
    LocalHost,
    /// An IP address plus port.
    IpAddress(SocketAddr),
    /// A 64-bit user id.
    User(u64),
    /// Free-form identity string.
    Generic(String),
}

impl Identity {
    /// True for the anonymous sentinel.
    pub fn is_localhost(&self) -> bool {
        matches!(self, Identity::LocalHost)
    }

    /// True when this identity carries no more information than the peer's
    /// observed address.
    pub fn is_anonymous_for(&self, remote: SocketAddr) -> bool {
        match self {
            Identity::LocalHost => true,
            Identity::IpAddress(addr) => *addr == remote,
            _ => false,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::LocalHost => f.write_str("localhost"),
            Identity::IpAddress(addr) => write!(f, "ip:{addr}"),
            Identity::User(id) => write!(f, "user:{id}"),
            Identity::Generic(s) => write!(f, "gen:{s}"),
        }
    }
}

/// Failure parsing the wire string form of an identity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityParseError {
    #[error("empty identity string")]
    Empty,
    #[error("unknown identity prefix in '{0}'")]
    UnknownPrefix(String),
    #[error("malformed identity value in '{0}'")]
    BadValue(String),
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdentityParseError::Empty);
        }
        if s == "localhost" {
            return Ok(Identity::LocalHost);
        }
        if let Some(rest) = s.strip_prefix("ip:") {
            let addr: SocketAddr = rest
                .parse()
                .map_err(|_| IdentityParseError::BadValue(s.to_owned()))?;
            return Ok(Identity::IpAddress(addr));
        }
        if let Some(rest) = s.strip_prefix("user:") {
            let id: u64 = rest
                .parse()
                .map_err(|_| IdentityParseError::BadValue(s.to_owned()))?;
            return Ok(Identity::User(id));
        }
        if let Some(rest) = s.strip_prefix("gen:") {
            return Ok(Identity::Generic(rest.to_owned()));
        }
        Err(IdentityParseError::UnknownPrefix(s.to_owned()))
    }
}

/// Key identifying one logical remote endpoint on a listener: the claimed
/// identity plus the connection id the remote chose for its own side.
///
/// A listener holds at most one connection per `RemoteKey` at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteKey {
    pub identity: Identity,
    pub remote_cid: u32,
}

impl RemoteKey {
    pub fn new(identity: Identity, remote_cid: u32) -> Self {
        Self {
            identity,
            remote_cid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        let cases = [
            Identity::LocalHost,
            Identity::IpAddress("[::1]:5555".parse().unwrap()),
            Identity::IpAddress("10.0.0.1:27015".parse().unwrap()),
            Identity::User(42),
            Identity::Generic("dedicated-server-7".into()),
        ];
        for id in cases {
            let rendered = id.to_string();
            let parsed: Identity = rendered.parse().expect("parse");
            assert_eq!(id, parsed, "round trip of {rendered}");
        }
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!("".parse::<Identity>(), Err(IdentityParseError::Empty));
        assert!(matches!(
            "steamid:1".parse::<Identity>(),
            Err(IdentityParseError::UnknownPrefix(_))
        ));
        assert!(matches!(
            "user:notanumber".parse::<Identity>(),
            Err(IdentityParseError::BadValue(_))
        ));
        assert!(matches!(
            "ip:nope".parse::<Identity>(),
            Err(IdentityParseError::BadValue(_))
        ));
    }

    #[test]
    fn anonymous_forms() {
        let remote: SocketAddr = "[::1]:7777".parse().unwrap();
        assert!(Identity::LocalHost.is_anonymous_for(remote));
        assert!(Identity::IpAddress(remote).is_anonymous_for(remote));
        assert!(!Identity::User(1).is_anonymous_for(remote));
        assert!(!Identity::IpAddress("[::1]:7778".parse().unwrap()).is_anonymous_for(remote));
    }
}
