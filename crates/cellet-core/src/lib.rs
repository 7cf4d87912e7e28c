//! Cellet Talk Core
//!
//! Protocol-level building blocks of the talk transport, shared by the
//! runtime and by applications:
//! - `Primitive` and its self-describing TLV codec
//! - connection framing (`Frame`, `encode_frame`, `decode_frame`)
//! - `TalkEvent` and the `TalkListener` callback surface
//! - the two-strike `HeartbeatMachine` and the per-cellet `Backlog`
//! - `NucleusConfig` and the error types
//!
//! Nothing in this crate performs I/O; the runtime drives it.

pub mod backlog;
pub mod codec;
pub mod config;
pub mod errors;
pub mod event;
pub mod frame;
pub mod heartbeat;
pub mod primitive;
pub mod types;

pub use backlog::Backlog;
pub use config::{DeviceClass, NucleusConfig};
pub use errors::{FailureCode, ProtocolError, SessionError, TalkError, TalkFailure, TalkResult};
pub use event::{TalkEvent, TalkListener};
pub use frame::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameHeader, PROTOCOL_VERSION};
pub use heartbeat::{HeartbeatAction, HeartbeatContext, HeartbeatMachine};
pub use primitive::{Literal, LiteralTag, Primitive, Stuff, StuffKind};
pub use types::{NucleusTag, ServerId, SessionId, TalkAddr};
