//! Error types for the Cellet talk transport
//!
//! This module contains the error types used across the talk protocol:
//! protocol errors raised while decoding primitives and frames, session
//! errors raised by lifecycle operations, and the TalkError type that
//! unifies them.

use std::fmt;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors raised while encoding or decoding bytes on the wire
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed primitive: {reason}")]
    MalformedPrimitive { reason: String },
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Frame checksum mismatch (expected {expected:08x}, got {actual:08x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("Unsupported protocol version: {0}")]
    VersionMismatch(u8),
}

/// Errors raised by server, speaker and cellet lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No server is listening on port {port}")]
    ServerNotListening { port: u16 },
    #[error("A server is already listening on port {port}")]
    ServerAlreadyRunning { port: u16 },
    #[error("Cellet not installed: {name}")]
    CelletNotInstalled { name: String },
    #[error("Cellet already installed: {name}")]
    CelletAlreadyInstalled { name: String },
    #[error("Cellet refused installation: {name}")]
    CelletInstallRefused { name: String },
    #[error("No cellet factory registered for {name}")]
    FactoryNotFound { name: String },
    #[error("No cellet names given for call to {addr}")]
    NoCellets { addr: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Main error type for the talk transport
#[derive(Debug, thiserror::Error)]
pub enum TalkError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

/// Result type for talk operations
pub type TalkResult<T> = Result<T, TalkError>;

impl TalkError {
    /// Create a malformed primitive error
    pub fn malformed<T: Into<String>>(reason: T) -> Self {
        TalkError::Protocol(ProtocolError::MalformedPrimitive {
            reason: reason.into(),
        })
    }

    /// Create a configuration error
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        TalkError::Configuration {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Failure Codes
// ----------------------------------------------------------------------------

/// Reason codes reported through `on_failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCode {
    /// The remote server does not host the requested cellet
    NotFound,
    /// The connection could not be established
    CallFailed,
    /// An established connection dropped unexpectedly
    TalkLost,
    /// The peer stayed silent for two heartbeat intervals
    HeartbeatTimeout,
    /// The peer sent bytes that break the framing
    IncorrectData,
    /// The peer rejected or botched the handshake
    HandshakeFailed,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCode::NotFound => "not-found",
            FailureCode::CallFailed => "call-failed",
            FailureCode::TalkLost => "talk-lost",
            FailureCode::HeartbeatTimeout => "heartbeat-timeout",
            FailureCode::IncorrectData => "incorrect-data",
            FailureCode::HandshakeFailed => "handshake-failed",
        };
        f.write_str(name)
    }
}

/// A session failure as delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkFailure {
    pub code: FailureCode,
    pub reason: String,
}

impl TalkFailure {
    pub fn new<R: Into<String>>(code: FailureCode, reason: R) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TalkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_constructor() {
        let err = TalkError::malformed("truncated entry");
        assert!(matches!(
            err,
            TalkError::Protocol(ProtocolError::MalformedPrimitive { .. })
        ));
        assert_eq!(
            err.to_string(),
            "Protocol error: Malformed primitive: truncated entry"
        );
    }

    #[test]
    fn test_failure_display() {
        let failure = TalkFailure::new(FailureCode::HeartbeatTimeout, "silent for 120s");
        assert_eq!(failure.to_string(), "heartbeat-timeout: silent for 120s");
    }
}
