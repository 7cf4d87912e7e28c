//! Listening endpoint hosting cellets
//!
//! A `BaseServer` accepts connections on one port, wraps each in a
//! [`TalkContext`] and routes inbound dialogue to the cellets bound on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use cellet_core::{
    Frame, Primitive, ProtocolError, ServerId, SessionId, TalkAddr, TalkResult, PROTOCOL_VERSION,
};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cellet::{CelletEvent, CelletRoute};
use crate::connection::{CloseCause, Connection, FrameHandler};
use crate::context::TalkContext;
use crate::env::TalkEnv;
use crate::sync::{lock, read, write};

// ----------------------------------------------------------------------------
// Servable
// ----------------------------------------------------------------------------

/// Read-only view of a listening endpoint
pub trait Servable: Send + Sync {
    fn host(&self) -> &str;
    fn port(&self) -> u16;
    /// Cellet names currently routable on this endpoint
    fn cellet_names(&self) -> Vec<String>;
    fn contexts(&self) -> Vec<Arc<TalkContext>>;
}

// ----------------------------------------------------------------------------
// Base Server
// ----------------------------------------------------------------------------

pub struct BaseServer {
    id: ServerId,
    host: String,
    port: u16,
    env: Arc<TalkEnv>,
    routes: RwLock<HashMap<String, CelletRoute>>,
    contexts: DashMap<SessionId, Arc<TalkContext>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl BaseServer {
    /// Bind `host:port` and start accepting; port 0 picks a free port
    pub(crate) async fn bind(host: &str, port: u16, env: Arc<TalkEnv>) -> TalkResult<Arc<Self>> {
        let listener = TcpListener::bind((host, port)).await?;
        let local = listener.local_addr()?;
        let server = Arc::new(Self {
            id: ServerId::new(env.next_id()),
            host: host.to_string(),
            port: local.port(),
            env,
            routes: RwLock::new(HashMap::new()),
            contexts: DashMap::new(),
            accept_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&server);
        let task = tokio::spawn(accept_loop(listener, weak));
        *lock(&server.accept_task) = Some(task);

        info!("server {} listening on {}", server.id, local);
        Ok(server)
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn context(&self, session: SessionId) -> Option<Arc<TalkContext>> {
        self.contexts.get(&session).map(|entry| entry.value().clone())
    }

    pub(crate) fn route(&self, cellet: &str) -> Option<CelletRoute> {
        read(&self.routes).get(cellet).cloned()
    }

    /// Make a cellet routable; false if it already was
    pub(crate) fn bind_cellet(&self, route: CelletRoute) -> bool {
        let name = route.name().to_string();
        let fresh = write(&self.routes).insert(name.clone(), route).is_none();
        if fresh {
            debug!("{} now routes {}", self.id, name);
        }
        fresh
    }

    /// Stop routing a cellet and revoke it from every context that declared it
    pub(crate) fn unbind_cellet(&self, name: &str) -> bool {
        let Some(route) = write(&self.routes).remove(name) else {
            return false;
        };
        for context in self.contexts() {
            if context.revoke(name) {
                context.connection().send_frame(&Frame::Revoke {
                    cellet: name.to_string(),
                });
                context.deliver(route.clone(), CelletEvent::Quitted);
            }
        }
        debug!("{} no longer routes {}", self.id, name);
        true
    }

    /// Close the listener and every context; idempotent
    pub(crate) fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
        for context in self.contexts() {
            context.hangup(true);
        }
        info!("server {} on port {} stopped", self.id, self.port);
    }

    fn admit(self: &Arc<Self>, stream: tokio::net::TcpStream, peer: TalkAddr) {
        if self.is_stopped() {
            return;
        }
        let id = self.env.next_id();
        let (connection, io) = Connection::new(
            stream,
            id,
            peer,
            self.env.config.max_frame_len,
            self.env.heartbeat.clone(),
        );
        let session = SessionId::new(id);
        let context = TalkContext::new(
            session,
            self.id,
            self.port,
            connection.clone(),
            self.env.config.hangup_drain(),
        );
        self.contexts.insert(session, context);

        let handler: Arc<dyn FrameHandler> = self.clone();
        connection.start(io, Arc::downgrade(&handler));
        self.env.heartbeat.register(&connection);
        debug!("{} accepted {} as {}", self.id, connection.remote(), session);
    }

    fn on_handshake(&self, context: &Arc<TalkContext>, version: u8, cellets: Vec<String>) {
        if version != PROTOCOL_VERSION {
            warn!(
                "{} speaks protocol {} (expected {}), closing",
                context.remote(),
                version,
                PROTOCOL_VERSION
            );
            context
                .connection()
                .abort(CloseCause::Handshake(ProtocolError::VersionMismatch(version).to_string()));
            return;
        }

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut contacted = Vec::new();
        for name in cellets {
            match self.route(&name) {
                Some(route) => {
                    if context.declare(&name) {
                        contacted.push(route);
                    }
                    accepted.push(name);
                }
                None => rejected.push(name),
            }
        }
        if !rejected.is_empty() {
            debug!("{} asked for unknown cellets {:?}", context.remote(), rejected);
        }

        // the ack must precede anything the cellet says in on_contacted
        context.connection().send_frame(&Frame::HandshakeAck {
            version: PROTOCOL_VERSION,
            tag: self.env.tag.to_string(),
            accepted,
            rejected,
        });
        for route in contacted {
            context.deliver(route, CelletEvent::Contacted);
        }
    }

    fn on_dialogue(
        &self,
        context: &Arc<TalkContext>,
        seq: u64,
        cellet: String,
        ack: bool,
        body: Vec<u8>,
    ) {
        let route = match self.route(&cellet) {
            Some(route) if context.has_cellet(&cellet) => route,
            _ => {
                debug!("{} spoke to unrouted cellet {}, dropped", context.session_id(), cellet);
                return;
            }
        };
        let primitive = match Primitive::decode(&body) {
            Ok(primitive) => primitive,
            Err(e) => {
                warn!("dropping dialogue {} from {}: {}", seq, context.remote(), e);
                return;
            }
        };
        if ack {
            context.connection().send_frame(&Frame::Ack { seq, cellet });
        }
        context.deliver(route, CelletEvent::Listened(primitive));
    }
}

impl FrameHandler for BaseServer {
    fn on_frame(&self, connection: &Arc<Connection>, frame: Frame) {
        let Some(context) = self.context(SessionId::new(connection.id())) else {
            return;
        };
        match frame {
            Frame::Handshake {
                version, cellets, ..
            } => self.on_handshake(&context, version, cellets),
            Frame::Dialogue {
                seq,
                cellet,
                ack,
                primitive,
            } => self.on_dialogue(&context, seq, cellet, ack, primitive),
            Frame::Ack { seq, .. } => match connection.resolve_ack(seq) {
                Some((cellet, primitive)) => match self.route(&cellet) {
                    Some(route) => context.deliver(route, CelletEvent::Ack(primitive)),
                    None => debug!("ack for unrouted cellet {}", cellet),
                },
                None => debug!("discarding late ack {} from {}", seq, connection.remote()),
            },
            Frame::Heartbeat => {
                connection.send_frame(&Frame::HeartbeatAck);
            }
            Frame::HeartbeatAck => {}
            other => warn!(
                "unexpected {} frame from client {}",
                other.kind(),
                connection.remote()
            ),
        }
    }

    fn on_closed(&self, connection: &Arc<Connection>, cause: CloseCause) {
        let Some((_, context)) = self.contexts.remove(&SessionId::new(connection.id())) else {
            return;
        };
        context.lock_out();
        for name in context.cellets() {
            if let Some(route) = self.route(&name) {
                context.deliver(route, CelletEvent::Quitted);
            }
        }
        debug!("{} left {}: {}", context.session_id(), self.id, cause);
    }
}

impl Servable for BaseServer {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn cellet_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.routes).keys().cloned().collect();
        names.sort();
        names
    }

    fn contexts(&self) -> Vec<Arc<TalkContext>> {
        self.contexts
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl std::fmt::Debug for BaseServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseServer")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("contexts", &self.contexts.len())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, server: Weak<BaseServer>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let Some(server) = server.upgrade() else {
                    break;
                };
                server.admit(stream, TalkAddr::from(peer));
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
