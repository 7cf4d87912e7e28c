//! Identity types shared by the talk transport

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::TalkError;

// ----------------------------------------------------------------------------
// Nucleus Tag
// ----------------------------------------------------------------------------

/// Process identity, a UUID rendered as a string
///
/// Equality is string equality. The tag is carried in handshakes for
/// correlation only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NucleusTag(String);

impl NucleusTag {
    /// Generate a fresh random tag
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Adopt a supplied tag; it must parse as a UUID
    pub fn parse(value: &str) -> Result<Self, TalkError> {
        let uuid = Uuid::parse_str(value)
            .map_err(|e| TalkError::config_error(format!("invalid nucleus tag {value}: {e}")))?;
        Ok(Self(uuid.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NucleusTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Talk Address
// ----------------------------------------------------------------------------

/// A (host, port) endpoint, the key for speakers and heartbeat contexts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TalkAddr {
    pub host: String,
    pub port: u16,
}

impl TalkAddr {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for TalkAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for TalkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for TalkAddr {
    type Err = TalkError;

    /// Parses `host:port` or `[v6-host]:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TalkError::InvalidAddress(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TalkError::InvalidAddress(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TalkError::InvalidAddress(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

// ----------------------------------------------------------------------------
// Session and Server Identifiers
// ----------------------------------------------------------------------------

/// Identifies one accepted connection on the server side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Identifies one BaseServer instance; a restart on the same port gets a new id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(u64);

impl ServerId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}
