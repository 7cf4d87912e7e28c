//! Client-side connections
//!
//! A `Speaker` is the single physical connection a kernel keeps per
//! (host, port). Cellet names are declared through handshakes; each accepted
//! name fires `Contacted` once per connection. All events of a speaker flow
//! through one channel to one dispatch task, so listeners see them in order
//! even across reconnects.
//!
//! ```text
//! Idle -> Connecting -> Handshaking -> Active -> Quitted | Failed
//!            ^                                      |
//!            +-------------- call() ----------------+
//! ```

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cellet_core::{
    FailureCode, Frame, Primitive, ProtocolError, TalkAddr, TalkEvent, TalkFailure,
    PROTOCOL_VERSION,
};
use smallvec::SmallVec;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::connection::{CloseCause, Connection, FrameHandler};
use crate::env::TalkEnv;
use crate::sync::lock;

// ----------------------------------------------------------------------------
// Speaker State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeakerState {
    Idle,
    Connecting,
    Handshaking,
    Active,
    Quitted,
    Failed,
}

impl SpeakerState {
    /// A connection is open or being opened
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SpeakerState::Connecting | SpeakerState::Handshaking | SpeakerState::Active
        )
    }
}

/// Client-side handle for an outbound connection
pub trait Speakable: Send + Sync {
    fn addr(&self) -> &TalkAddr;
    fn state(&self) -> SpeakerState;
    /// Cellet names declared on this speaker, in declaration order
    fn cellets(&self) -> SmallVec<[String; 4]>;
    fn is_contacted(&self, cellet: &str) -> bool;
}

// ----------------------------------------------------------------------------
// Speaker
// ----------------------------------------------------------------------------

struct SpeakerInner {
    state: SpeakerState,
    declared: Vec<String>,
    requested: BTreeSet<String>,
    contacted: BTreeSet<String>,
    connection: Option<Arc<Connection>>,
    generation: u64,
}

pub struct Speaker {
    addr: TalkAddr,
    env: Arc<TalkEnv>,
    inner: Mutex<SpeakerInner>,
    events: mpsc::UnboundedSender<TalkEvent>,
}

impl Speaker {
    pub(crate) fn new(addr: TalkAddr, env: Arc<TalkEnv>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TalkEvent>();
        let dispatch_env = env.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match dispatch_env.listener(event.cellet()) {
                    Some(listener) => event.dispatch(listener.as_ref()),
                    None => trace!("no listener for {} event on {}", event.name(), event.cellet()),
                }
            }
        });

        Arc::new(Self {
            addr,
            env,
            inner: Mutex::new(SpeakerInner {
                state: SpeakerState::Idle,
                declared: Vec::new(),
                requested: BTreeSet::new(),
                contacted: BTreeSet::new(),
                connection: None,
                generation: 0,
            }),
            events: tx,
        })
    }

    fn emit(&self, event: TalkEvent) {
        if self.events.send(event).is_err() {
            debug!("{} dispatcher gone, event dropped", self.addr);
        }
    }

    fn emit_failed_and_quitted(&self, names: &[String], failure: Option<TalkFailure>) {
        if let Some(failure) = failure {
            for name in names {
                self.emit(TalkEvent::Failed {
                    speaker: self.addr.clone(),
                    cellet: name.clone(),
                    failure: failure.clone(),
                });
            }
        }
        for name in names {
            self.emit(TalkEvent::Quitted {
                speaker: self.addr.clone(),
                cellet: name.clone(),
            });
        }
    }

    /// Declare cellet names, connecting if no connection is live
    pub(crate) fn call(self: &Arc<Self>, names: &[String]) {
        let mut inner = lock(&self.inner);
        for name in names {
            if !inner.declared.contains(name) {
                inner.declared.push(name.clone());
            }
        }

        match inner.state {
            SpeakerState::Idle | SpeakerState::Quitted | SpeakerState::Failed => {
                inner.state = SpeakerState::Connecting;
                inner.generation += 1;
                let generation = inner.generation;
                drop(inner);
                info!("calling {} for {:?}", self.addr, names);
                tokio::spawn(self.clone().connect(generation));
            }
            SpeakerState::Connecting => {}
            SpeakerState::Handshaking | SpeakerState::Active => {
                // includes names revoked by the server since the last handshake
                let undeclared: Vec<String> = names
                    .iter()
                    .filter(|name| !inner.requested.contains(*name))
                    .cloned()
                    .collect();
                if undeclared.is_empty() {
                    return;
                }
                if let Some(connection) = inner.connection.clone() {
                    inner.requested.extend(undeclared.iter().cloned());
                    debug!("re-declaring {:?} on {}", undeclared, self.addr);
                    connection.send_frame(&Frame::handshake(self.env.tag.to_string(), undeclared));
                }
            }
        }
    }

    async fn connect(self: Arc<Self>, generation: u64) {
        let timeout = self.env.config.connect_timeout();
        let target = (self.addr.host.clone(), self.addr.port);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.connect_failed(generation, e.to_string()),
            Err(_) => return self.connect_failed(generation, format!("timed out after {timeout:?}")),
        };

        let (connection, io) = Connection::new(
            stream,
            self.env.next_id(),
            self.addr.clone(),
            self.env.config.max_frame_len,
            self.env.heartbeat.clone(),
        );

        let names = {
            let mut inner = lock(&self.inner);
            if inner.generation != generation || inner.state != SpeakerState::Connecting {
                debug!("call to {} superseded, dropping socket", self.addr);
                return;
            }
            inner.state = SpeakerState::Handshaking;
            inner.connection = Some(connection.clone());
            inner.requested = inner.declared.iter().cloned().collect();
            inner.contacted.clear();
            inner.declared.clone()
        };

        let handler: Arc<dyn FrameHandler> = self.clone();
        connection.start(io, Arc::downgrade(&handler));
        self.env.heartbeat.register(&connection);
        connection.send_frame(&Frame::handshake(self.env.tag.to_string(), names));

        let speaker = Arc::downgrade(&self);
        let watched = connection.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let stalled = speaker.upgrade().is_some_and(|speaker| {
                let inner = lock(&speaker.inner);
                inner.state == SpeakerState::Handshaking
                    && inner.connection.as_ref().map(|c| c.id()) == Some(watched.id())
            });
            if stalled {
                warn!("handshake with {} timed out", watched.remote());
                watched.abort(CloseCause::Handshake("handshake timed out".to_string()));
            }
        });
    }

    fn connect_failed(&self, generation: u64, reason: String) {
        let names = {
            let mut inner = lock(&self.inner);
            if inner.generation != generation || inner.state != SpeakerState::Connecting {
                return;
            }
            inner.state = SpeakerState::Failed;
            inner.declared.clone()
        };
        warn!("call to {} failed: {}", self.addr, reason);
        self.emit_failed_and_quitted(&names, Some(TalkFailure::new(FailureCode::CallFailed, reason)));
    }

    /// Send to a contacted cellet; false if the cellet is not reachable here
    pub(crate) fn speak(&self, cellet: &str, primitive: Primitive, ack: bool, timeout: Duration) -> bool {
        // held across the send so Spoke is queued before any Ack for it
        let inner = lock(&self.inner);
        if inner.state != SpeakerState::Active || !inner.contacted.contains(cellet) {
            return false;
        }
        let Some(connection) = inner.connection.clone() else {
            return false;
        };

        let events = self.events.clone();
        let speaker = self.addr.clone();
        let sent = connection.send_dialogue(cellet, &primitive, ack, timeout, move |cellet, primitive| {
            let _ = events.send(TalkEvent::SpeakTimeout {
                speaker,
                cellet,
                primitive,
            });
        });
        if sent {
            self.emit(TalkEvent::Spoke {
                speaker: self.addr.clone(),
                cellet: cellet.to_string(),
                primitive,
            });
        }
        sent
    }

    /// Close the connection and quit every declared cellet
    pub(crate) fn hangup(&self, now: bool) {
        let (connection, names) = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            let was_live = inner.state.is_live();
            inner.state = SpeakerState::Quitted;
            inner.requested.clear();
            inner.contacted.clear();
            let names = if was_live { inner.declared.clone() } else { Vec::new() };
            (inner.connection.take(), names)
        };
        if let Some(connection) = connection {
            connection.close(now, self.env.config.hangup_drain());
        }
        info!("hung up on {}", self.addr);
        self.emit_failed_and_quitted(&names, None);
    }

    pub fn contacted(&self) -> Vec<String> {
        lock(&self.inner).contacted.iter().cloned().collect()
    }

    /// Sends on the current connection still waiting for an ack
    pub fn pending_acks(&self) -> usize {
        lock(&self.inner)
            .connection
            .as_ref()
            .map(|connection| connection.pending_acks())
            .unwrap_or(0)
    }

    fn on_handshake_ack(
        &self,
        connection: &Arc<Connection>,
        version: u8,
        accepted: Vec<String>,
        rejected: Vec<String>,
    ) {
        if version != PROTOCOL_VERSION {
            warn!("{} answered with protocol {}", self.addr, version);
            connection.abort(CloseCause::Handshake(ProtocolError::VersionMismatch(version).to_string()));
            return;
        }

        let mut inner = lock(&self.inner);
        inner.state = SpeakerState::Active;
        for name in accepted {
            if inner.contacted.insert(name.clone()) {
                info!("contacted {} on {}", name, self.addr);
                self.emit(TalkEvent::Contacted {
                    speaker: self.addr.clone(),
                    cellet: name,
                });
            }
        }
        for name in rejected {
            warn!("{} does not host {}", self.addr, name);
            inner.requested.remove(&name);
            inner.declared.retain(|declared| declared != &name);
            self.emit_failed_and_quitted(
                std::slice::from_ref(&name),
                Some(TalkFailure::new(
                    FailureCode::NotFound,
                    format!("{} does not host {}", self.addr, name),
                )),
            );
        }

        // names declared while the first handshake was in flight
        let late: Vec<String> = inner
            .declared
            .iter()
            .filter(|name| !inner.requested.contains(*name))
            .cloned()
            .collect();
        if !late.is_empty() {
            inner.requested.extend(late.iter().cloned());
            connection.send_frame(&Frame::handshake(self.env.tag.to_string(), late));
        }
    }

    fn on_dialogue(&self, connection: &Arc<Connection>, seq: u64, cellet: String, ack: bool, body: Vec<u8>) {
        let inner = lock(&self.inner);
        if !inner.contacted.contains(&cellet) {
            debug!("dialogue from uncontacted cellet {} on {}, dropped", cellet, self.addr);
            return;
        }
        let primitive = match Primitive::decode(&body) {
            Ok(primitive) => primitive,
            Err(e) => {
                warn!("dropping dialogue {} from {}: {}", seq, self.addr, e);
                return;
            }
        };
        if ack {
            connection.send_frame(&Frame::Ack {
                seq,
                cellet: cellet.clone(),
            });
        }
        self.emit(TalkEvent::Listened {
            speaker: self.addr.clone(),
            cellet,
            primitive,
        });
    }

    fn is_current(&self, connection: &Connection) -> bool {
        lock(&self.inner).connection.as_ref().map(|c| c.id()) == Some(connection.id())
    }
}

impl FrameHandler for Speaker {
    fn on_frame(&self, connection: &Arc<Connection>, frame: Frame) {
        if !self.is_current(connection) {
            return;
        }
        match frame {
            Frame::HandshakeAck {
                version,
                accepted,
                rejected,
                ..
            } => self.on_handshake_ack(connection, version, accepted, rejected),
            Frame::Dialogue {
                seq,
                cellet,
                ack,
                primitive,
            } => self.on_dialogue(connection, seq, cellet, ack, primitive),
            Frame::Ack { seq, .. } => {
                let _inner = lock(&self.inner);
                match connection.resolve_ack(seq) {
                    Some((cellet, primitive)) => self.emit(TalkEvent::Ack {
                        speaker: self.addr.clone(),
                        cellet,
                        primitive,
                    }),
                    None => debug!("discarding late ack {} from {}", seq, self.addr),
                }
            }
            Frame::Revoke { cellet } => {
                let mut inner = lock(&self.inner);
                inner.requested.remove(&cellet);
                if inner.contacted.remove(&cellet) {
                    info!("{} revoked {}", self.addr, cellet);
                    self.emit(TalkEvent::Quitted {
                        speaker: self.addr.clone(),
                        cellet,
                    });
                }
            }
            Frame::Heartbeat => {
                connection.send_frame(&Frame::HeartbeatAck);
            }
            Frame::HeartbeatAck => {}
            Frame::Handshake { .. } => {
                warn!("unexpected handshake from server {}", self.addr);
            }
        }
    }

    fn on_closed(&self, connection: &Arc<Connection>, cause: CloseCause) {
        let names = {
            let mut inner = lock(&self.inner);
            if inner.connection.as_ref().map(|c| c.id()) != Some(connection.id()) {
                return;
            }
            inner.connection = None;
            inner.state = if cause.failure().is_some() {
                SpeakerState::Failed
            } else {
                SpeakerState::Quitted
            };
            inner.requested.clear();
            inner.contacted.clear();
            inner.declared.clone()
        };
        info!("connection to {} ended: {}", self.addr, cause);
        self.emit_failed_and_quitted(&names, cause.failure());
    }
}

impl Speakable for Speaker {
    fn addr(&self) -> &TalkAddr {
        &self.addr
    }

    fn state(&self) -> SpeakerState {
        lock(&self.inner).state
    }

    fn cellets(&self) -> SmallVec<[String; 4]> {
        lock(&self.inner).declared.iter().cloned().collect()
    }

    fn is_contacted(&self, cellet: &str) -> bool {
        lock(&self.inner).contacted.contains(cellet)
    }
}

impl std::fmt::Debug for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Speaker")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}
