//! Talk events and the listener surface
//!
//! Connections publish [`TalkEvent`] values on their event channel; a
//! dispatcher hands each event to the one [`TalkListener`] registered for the
//! event's cellet name.

use crate::errors::TalkFailure;
use crate::primitive::Primitive;
use crate::types::TalkAddr;

// ----------------------------------------------------------------------------
// Talk Events
// ----------------------------------------------------------------------------

/// Event raised on the speaking side of a connection
#[derive(Debug, Clone, PartialEq)]
pub enum TalkEvent {
    /// A primitive arrived from the remote cellet
    Listened {
        speaker: TalkAddr,
        cellet: String,
        primitive: Primitive,
    },
    /// A primitive was queued on the connection
    Spoke {
        speaker: TalkAddr,
        cellet: String,
        primitive: Primitive,
    },
    /// The remote side acknowledged a primitive
    Ack {
        speaker: TalkAddr,
        cellet: String,
        primitive: Primitive,
    },
    /// No ack arrived within the ack timeout
    SpeakTimeout {
        speaker: TalkAddr,
        cellet: String,
        primitive: Primitive,
    },
    /// The remote side accepted the cellet name
    Contacted { speaker: TalkAddr, cellet: String },
    /// The cellet is no longer reachable through this speaker
    Quitted { speaker: TalkAddr, cellet: String },
    /// A session failure; always followed by `Quitted`
    Failed {
        speaker: TalkAddr,
        cellet: String,
        failure: TalkFailure,
    },
}

impl TalkEvent {
    pub fn cellet(&self) -> &str {
        match self {
            TalkEvent::Listened { cellet, .. }
            | TalkEvent::Spoke { cellet, .. }
            | TalkEvent::Ack { cellet, .. }
            | TalkEvent::SpeakTimeout { cellet, .. }
            | TalkEvent::Contacted { cellet, .. }
            | TalkEvent::Quitted { cellet, .. }
            | TalkEvent::Failed { cellet, .. } => cellet,
        }
    }

    pub fn speaker(&self) -> &TalkAddr {
        match self {
            TalkEvent::Listened { speaker, .. }
            | TalkEvent::Spoke { speaker, .. }
            | TalkEvent::Ack { speaker, .. }
            | TalkEvent::SpeakTimeout { speaker, .. }
            | TalkEvent::Contacted { speaker, .. }
            | TalkEvent::Quitted { speaker, .. }
            | TalkEvent::Failed { speaker, .. } => speaker,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TalkEvent::Listened { .. } => "listened",
            TalkEvent::Spoke { .. } => "spoke",
            TalkEvent::Ack { .. } => "ack",
            TalkEvent::SpeakTimeout { .. } => "speak-timeout",
            TalkEvent::Contacted { .. } => "contacted",
            TalkEvent::Quitted { .. } => "quitted",
            TalkEvent::Failed { .. } => "failed",
        }
    }

    /// Invoke the matching listener callback
    pub fn dispatch(&self, listener: &dyn TalkListener) {
        match self {
            TalkEvent::Listened {
                speaker,
                cellet,
                primitive,
            } => listener.on_listened(speaker, cellet, primitive),
            TalkEvent::Spoke {
                speaker,
                cellet,
                primitive,
            } => listener.on_spoke(speaker, cellet, primitive),
            TalkEvent::Ack {
                speaker,
                cellet,
                primitive,
            } => listener.on_ack(speaker, cellet, primitive),
            TalkEvent::SpeakTimeout {
                speaker,
                cellet,
                primitive,
            } => listener.on_speak_timeout(speaker, cellet, primitive),
            TalkEvent::Contacted { speaker, cellet } => listener.on_contacted(speaker, cellet),
            TalkEvent::Quitted { speaker, cellet } => listener.on_quitted(speaker, cellet),
            TalkEvent::Failed {
                speaker,
                cellet,
                failure,
            } => listener.on_failed(speaker, cellet, failure),
        }
    }
}

// ----------------------------------------------------------------------------
// Talk Listener
// ----------------------------------------------------------------------------

/// Callbacks for one cellet name
///
/// Callbacks run on the connection's dispatch task. Work that may block
/// should be moved onto its own task.
#[allow(unused_variables)]
pub trait TalkListener: Send + Sync {
    fn on_listened(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {}

    fn on_spoke(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {}

    fn on_ack(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {}

    fn on_speak_timeout(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {}

    fn on_contacted(&self, speaker: &TalkAddr, cellet: &str) {}

    fn on_quitted(&self, speaker: &TalkAddr, cellet: &str) {}

    fn on_failed(&self, speaker: &TalkAddr, cellet: &str, failure: &TalkFailure) {}

    /// Called once when another listener replaces this one, or it is removed
    fn on_detached(&self, cellet: &str) {}
}
