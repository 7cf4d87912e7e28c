//! Cellet Talk Runtime
//!
//! This crate runs the talk transport on tokio, including:
//! - `Nucleus`: the process root owning both kernels
//! - `TalkServiceKernel`: servers, speakers, listeners and the ack policy
//! - `CelletServiceKernel`: cellet installation, activation and dispatch
//! - `UninterruptedOperator`: buffering and replay across disconnects
//! - heartbeat liveness for every open connection
//!
//! `cellet-core` provides the wire format and the types shared with
//! applications; this crate is where the I/O happens.

mod connection;
mod env;
mod heartbeat;
mod sync;

pub mod cellet;
pub mod cellet_kernel;
pub mod context;
pub mod nucleus;
pub mod server;
pub mod service;
pub mod speaker;
pub mod talk_kernel;
pub mod uninterrupted;

pub use cellet::{Cellet, CelletService};
pub use cellet_kernel::CelletServiceKernel;
pub use context::TalkContext;
pub use nucleus::{CelletFactory, Nucleus};
pub use server::{BaseServer, Servable};
pub use service::TalkService;
pub use speaker::{Speakable, Speaker, SpeakerState};
pub use talk_kernel::TalkServiceKernel;
pub use uninterrupted::UninterruptedOperator;

// Re-export core types for convenience
pub use cellet_core::{
    FailureCode, HeartbeatContext, Literal, NucleusConfig, NucleusTag, Primitive, SessionError,
    SessionId, Stuff, StuffKind, TalkAddr, TalkError, TalkEvent, TalkFailure, TalkListener,
    TalkResult,
};
