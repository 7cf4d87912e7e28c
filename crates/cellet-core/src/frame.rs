//! Connection framing for the talk protocol
//!
//! Every frame on a socket is `len: u32 BE | crc32: u32 BE | body`, where the
//! body is a bincode-encoded [`Frame`] and the checksum covers the body. A
//! length beyond the configured maximum means the stream can no longer be
//! trusted and the connection must be closed. A checksum or bincode failure
//! only spoils the frame itself, which the reader skips.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, TalkError, TalkResult};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Wire protocol version carried in handshakes
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the frame header: body length + checksum
pub const FRAME_HEADER_SIZE: usize = 8;

/// Default cap on body length
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

// ----------------------------------------------------------------------------
// Frame Types
// ----------------------------------------------------------------------------

/// Frames exchanged between a speaker and a server context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Client declares the cellet names it wants to talk to
    Handshake {
        version: u8,
        tag: String,
        cellets: Vec<String>,
    },
    /// Server answers a handshake with the names it hosts
    HandshakeAck {
        version: u8,
        tag: String,
        accepted: Vec<String>,
        rejected: Vec<String>,
    },
    /// A primitive addressed to a cellet; `primitive` holds the TLV bytes
    Dialogue {
        seq: u64,
        cellet: String,
        ack: bool,
        primitive: Vec<u8>,
    },
    /// Acknowledges the dialogue with the same sequence number
    Ack { seq: u64, cellet: String },
    /// The server no longer routes this cellet
    Revoke { cellet: String },
    /// Liveness probe
    Heartbeat,
    /// Reply to a liveness probe
    HeartbeatAck,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Handshake { .. } => "handshake",
            Frame::HandshakeAck { .. } => "handshake-ack",
            Frame::Dialogue { .. } => "dialogue",
            Frame::Ack { .. } => "ack",
            Frame::Revoke { .. } => "revoke",
            Frame::Heartbeat => "heartbeat",
            Frame::HeartbeatAck => "heartbeat-ack",
        }
    }

    pub fn handshake<T: Into<String>>(tag: T, cellets: Vec<String>) -> Self {
        Frame::Handshake {
            version: PROTOCOL_VERSION,
            tag: tag.into(),
            cellets,
        }
    }
}

// ----------------------------------------------------------------------------
// Frame Header
// ----------------------------------------------------------------------------

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: usize,
    pub checksum: u32,
}

impl FrameHeader {
    /// Parse a header, rejecting lengths beyond `max_len`
    pub fn parse(bytes: [u8; FRAME_HEADER_SIZE], max_len: u32) -> Result<Self, ProtocolError> {
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let checksum = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if len > max_len {
            return Err(ProtocolError::FrameTooLarge {
                size: len as usize,
                max: max_len as usize,
            });
        }
        Ok(Self {
            len: len as usize,
            checksum,
        })
    }

    /// Verify the checksum and decode the body
    pub fn decode_body(&self, body: &[u8]) -> TalkResult<Frame> {
        let actual = crc32fast::hash(body);
        if actual != self.checksum {
            return Err(ProtocolError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            }
            .into());
        }
        Ok(bincode::deserialize(body)?)
    }
}

// ----------------------------------------------------------------------------
// Encoding and Decoding
// ----------------------------------------------------------------------------

/// Encode a frame with its header
pub fn encode_frame(frame: &Frame, max_len: u32) -> TalkResult<Vec<u8>> {
    let body = bincode::serialize(frame)?;
    if body.len() > max_len as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: max_len as usize,
        }
        .into());
    }

    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Error decoding one frame from a buffer
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("framing corrupted: {0}")]
    Unrecoverable(ProtocolError),
    #[error("frame dropped after {consumed} bytes: {source}")]
    Dropped {
        consumed: usize,
        #[source]
        source: TalkError,
    },
}

/// Decode one frame from the front of `bytes`
///
/// On success returns the frame and the number of bytes consumed. A
/// `Dropped` error still reports how many bytes to skip.
pub fn decode_frame(bytes: &[u8], max_len: u32) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let mut raw = [0u8; FRAME_HEADER_SIZE];
    raw.copy_from_slice(&bytes[..FRAME_HEADER_SIZE]);
    let header = FrameHeader::parse(raw, max_len).map_err(FrameDecodeError::Unrecoverable)?;

    let total = FRAME_HEADER_SIZE + header.len;
    if bytes.len() < total {
        return Err(FrameDecodeError::NeedMore);
    }

    match header.decode_body(&bytes[FRAME_HEADER_SIZE..total]) {
        Ok(frame) => Ok((frame, total)),
        Err(source) => Err(FrameDecodeError::Dropped {
            consumed: total,
            source,
        }),
    }
}
