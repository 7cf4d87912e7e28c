//! Server-side session handle

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use cellet_core::{Primitive, ServerId, SessionId, TalkAddr};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cellet::{CelletEvent, CelletRoute};
use crate::connection::Connection;
use crate::sync::{lock, read, write};

pub(crate) struct ContextDelivery {
    context: Arc<TalkContext>,
    route: CelletRoute,
    event: CelletEvent,
}

/// One accepted connection on a server
///
/// Refers to its server by port and instance id only. A context is never
/// reused: a client that reconnects gets a new one.
pub struct TalkContext {
    session: SessionId,
    remote: TalkAddr,
    server_id: ServerId,
    port: u16,
    connection: Arc<Connection>,
    lock: RwLock<bool>,
    cellets: Mutex<BTreeSet<String>>,
    events: mpsc::UnboundedSender<ContextDelivery>,
    drain: Duration,
}

impl TalkContext {
    pub(crate) fn new(
        session: SessionId,
        server_id: ServerId,
        port: u16,
        connection: Arc<Connection>,
        drain: Duration,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ContextDelivery>();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                delivery.route.deliver(&delivery.context, delivery.event);
            }
        });

        Arc::new(Self {
            session,
            remote: connection.remote().clone(),
            server_id,
            port,
            connection,
            lock: RwLock::new(false),
            cellets: Mutex::new(BTreeSet::new()),
            events: tx,
            drain,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn remote(&self) -> &TalkAddr {
        &self.remote
    }

    /// Port of the owning server
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Set once hangup starts; a locked context never sends again
    pub fn is_locked(&self) -> bool {
        *read(&self.lock)
    }

    /// Cellet names the client declared and the server accepted
    pub fn cellets(&self) -> Vec<String> {
        lock(&self.cellets).iter().cloned().collect()
    }

    pub fn has_cellet(&self, name: &str) -> bool {
        lock(&self.cellets).contains(name)
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn declare(&self, name: &str) -> bool {
        lock(&self.cellets).insert(name.to_string())
    }

    pub(crate) fn revoke(&self, name: &str) -> bool {
        lock(&self.cellets).remove(name)
    }

    pub(crate) fn deliver(self: &Arc<Self>, route: CelletRoute, event: CelletEvent) {
        let delivery = ContextDelivery {
            context: self.clone(),
            route,
            event,
        };
        if self.events.send(delivery).is_err() {
            debug!("{} dispatcher gone, event dropped", self.session);
        }
    }

    /// Send through `route` unless the context is locked
    ///
    /// The lock is held for reading across the send, so a concurrent hangup
    /// either happens entirely before (and the send is refused) or after.
    pub(crate) fn speak(
        self: &Arc<Self>,
        route: &CelletRoute,
        primitive: Primitive,
        ack: bool,
        timeout: Duration,
    ) -> bool {
        let locked = read(&self.lock);
        if *locked {
            debug!("{} is locked, not sending to {}", self.session, route.name());
            return false;
        }
        if !self.has_cellet(route.name()) {
            debug!("{} never declared {}", self.session, route.name());
            return false;
        }

        let context = self.clone();
        let timeout_route = route.clone();
        self.connection.send_dialogue(
            route.name(),
            &primitive,
            ack,
            timeout,
            move |_, primitive| context.deliver(timeout_route, CelletEvent::SpeakTimeout(primitive)),
        )
    }

    /// Lock the context, then close its connection
    pub(crate) fn hangup(&self, now: bool) {
        self.lock_out();
        self.connection.close(now, self.drain);
    }

    pub(crate) fn lock_out(&self) {
        *write(&self.lock) = true;
    }
}

impl std::fmt::Debug for TalkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TalkContext")
            .field("session", &self.session)
            .field("remote", &self.remote)
            .field("port", &self.port)
            .field("locked", &self.is_locked())
            .finish()
    }
}
