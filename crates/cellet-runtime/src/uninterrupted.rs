//! Reconnection resilience
//!
//! `UninterruptedOperator` decorates a [`TalkService`] so that `speak` stays
//! available while a cellet's connection is down. Sends made during an outage
//! land in a per-cellet [`Backlog`] and are replayed, ack queue first, once
//! the cellet is contacted again. Application listeners still see every
//! `on_failed` and `on_quitted`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cellet_core::{
    Backlog, FailureCode, HeartbeatContext, Primitive, TalkAddr, TalkFailure, TalkListener,
    TalkResult,
};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::service::TalkService;
use crate::speaker::Speakable;
use crate::sync::lock;
use crate::talk_kernel::TalkServiceKernel;

// ----------------------------------------------------------------------------
// Operator State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct BacklogEntry {
    backlog: Backlog,
    draining: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainStep {
    Sent,
    Done,
    Interrupted,
}

struct OperatorState {
    listeners: DashMap<String, Arc<dyn TalkListener>>,
    relays: Mutex<HashSet<String>>,
    backlogs: Mutex<HashMap<String, BacklogEntry>>,
    /// Cellet names last called on each speaker
    routes: DashMap<TalkAddr, BTreeSet<String>>,
    /// Cellet names the peer accepted on each speaker's current connection
    contacted: DashMap<TalkAddr, BTreeSet<String>>,
    recalling: Mutex<HashSet<TalkAddr>>,
    hung_up: Mutex<HashSet<TalkAddr>>,
    reconnect_interval: Option<Duration>,
}

impl OperatorState {
    fn listener(&self, cellet: &str) -> Option<Arc<dyn TalkListener>> {
        self.listeners.get(cellet).map(|entry| entry.value().clone())
    }

    fn open_backlogs<'a>(&self, names: impl IntoIterator<Item = &'a String>) {
        let mut backlogs = lock(&self.backlogs);
        for name in names {
            let entry = backlogs.entry(name.clone()).or_default();
            if entry.draining {
                // the drain task stops at its next failed send
                entry.draining = false;
            }
            debug!("buffering sends to {}", name);
        }
    }

    fn route_names(&self, speaker: &TalkAddr) -> BTreeSet<String> {
        self.routes
            .get(speaker)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Forget `cellet` on `speaker`; its backlog goes too unless another speaker routes it
    fn drop_route(&self, speaker: &TalkAddr, cellet: &str) {
        if let Some(mut names) = self.routes.get_mut(speaker) {
            names.remove(cellet);
        }
        if let Some(mut names) = self.contacted.get_mut(speaker) {
            names.remove(cellet);
        }
        if self.routes.iter().any(|entry| entry.value().contains(cellet)) {
            return;
        }
        if let Some(entry) = lock(&self.backlogs).remove(cellet) {
            if !entry.backlog.is_empty() {
                warn!("discarding {} buffered sends to {}", entry.backlog.len(), cellet);
            }
        }
    }
}

/// Pop one buffered primitive and send it through `inner`
fn drain_step<S: TalkService>(inner: &S, state: &OperatorState, cellet: &str) -> DrainStep {
    let (primitive, ack) = {
        let mut backlogs = lock(&state.backlogs);
        let Some(entry) = backlogs.get_mut(cellet) else {
            return DrainStep::Done;
        };
        if !entry.draining {
            return DrainStep::Interrupted;
        }
        match entry.backlog.pop_next() {
            Some(next) => next,
            None => {
                backlogs.remove(cellet);
                info!("backlog for {} drained", cellet);
                return DrainStep::Done;
            }
        }
    };

    if inner.speak(cellet, primitive.clone(), ack) {
        return DrainStep::Sent;
    }
    let mut backlogs = lock(&state.backlogs);
    let entry = backlogs.entry(cellet.to_string()).or_default();
    entry.backlog.requeue_front(primitive, ack);
    entry.draining = false;
    debug!("replay to {} interrupted, {} left", cellet, entry.backlog.len());
    DrainStep::Interrupted
}

// ----------------------------------------------------------------------------
// Relay Listener
// ----------------------------------------------------------------------------

/// Listener registered with the decorated service for one cellet name
struct RelayListener<S: TalkService> {
    cellet: String,
    inner: Weak<S>,
    state: Arc<OperatorState>,
}

impl<S: TalkService> RelayListener<S> {
    fn forward(&self, f: impl FnOnce(&dyn TalkListener)) {
        if let Some(listener) = self.state.listener(&self.cellet) {
            f(listener.as_ref());
        }
    }

    fn start_drain(&self, cellet: &str) {
        {
            let mut backlogs = lock(&self.state.backlogs);
            match backlogs.get_mut(cellet) {
                Some(entry) if !entry.draining => entry.draining = true,
                _ => return,
            }
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        info!("replaying backlog for {}", cellet);
        // first send inline so replay has begun before on_contacted is forwarded
        if drain_step(inner.as_ref(), &self.state, cellet) != DrainStep::Sent {
            return;
        }
        let state = self.state.clone();
        let cellet = cellet.to_string();
        tokio::spawn(async move {
            loop {
                tokio::task::yield_now().await;
                if drain_step(inner.as_ref(), &state, &cellet) != DrainStep::Sent {
                    break;
                }
            }
        });
    }

    fn schedule_recall(&self, speaker: &TalkAddr) {
        let Some(interval) = self.state.reconnect_interval else {
            return;
        };
        if !lock(&self.state.recalling).insert(speaker.clone()) {
            return;
        }

        let inner = self.inner.clone();
        let state = self.state.clone();
        let speaker = speaker.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !lock(&state.recalling).contains(&speaker) {
                    break;
                }
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if inner.is_called_at(&speaker.host, speaker.port) {
                    continue;
                }
                let names = state.route_names(&speaker);
                if names.is_empty() {
                    lock(&state.recalling).remove(&speaker);
                    break;
                }
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                info!("recalling {} for {:?}", speaker, names);
                if let Err(e) = inner.call(&speaker.host, speaker.port, &names) {
                    warn!("recall of {} failed: {}", speaker, e);
                }
            }
        });
    }
}

impl<S: TalkService> TalkListener for RelayListener<S> {
    fn on_listened(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        self.forward(|l| l.on_listened(speaker, cellet, primitive));
    }

    fn on_spoke(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        self.forward(|l| l.on_spoke(speaker, cellet, primitive));
    }

    fn on_ack(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        self.forward(|l| l.on_ack(speaker, cellet, primitive));
    }

    fn on_speak_timeout(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        self.forward(|l| l.on_speak_timeout(speaker, cellet, primitive));
    }

    fn on_contacted(&self, speaker: &TalkAddr, cellet: &str) {
        self.state
            .routes
            .entry(speaker.clone())
            .or_default()
            .insert(cellet.to_string());
        self.state
            .contacted
            .entry(speaker.clone())
            .or_default()
            .insert(cellet.to_string());
        lock(&self.state.recalling).remove(speaker);

        self.start_drain(cellet);
        self.forward(|l| l.on_contacted(speaker, cellet));
    }

    fn on_quitted(&self, speaker: &TalkAddr, cellet: &str) {
        if lock(&self.state.hung_up).contains(speaker) {
            self.forward(|l| l.on_quitted(speaker, cellet));
            return;
        }

        let connected = self
            .inner
            .upgrade()
            .is_some_and(|inner| inner.is_called_at(&speaker.host, speaker.port));
        if connected {
            // revoked by the server while the connection stays up
            let was_contacted = self
                .state
                .contacted
                .get_mut(speaker)
                .is_some_and(|mut names| names.remove(cellet));
            if was_contacted {
                self.state.open_backlogs(std::iter::once(&cellet.to_string()));
            }
        } else {
            if let Some((_, names)) = self.state.contacted.remove(speaker) {
                self.state.open_backlogs(names.iter());
            }
            self.schedule_recall(speaker);
        }
        self.forward(|l| l.on_quitted(speaker, cellet));
    }

    fn on_failed(&self, speaker: &TalkAddr, cellet: &str, failure: &TalkFailure) {
        if failure.code == FailureCode::NotFound {
            debug!("{} does not host {}, no longer routed", speaker, cellet);
            self.state.drop_route(speaker, cellet);
        }
        self.forward(|l| l.on_failed(speaker, cellet, failure));
    }
}

// ----------------------------------------------------------------------------
// Uninterrupted Operator
// ----------------------------------------------------------------------------

/// [`TalkService`] decorator that buffers sends across disconnects
pub struct UninterruptedOperator<S: TalkService = TalkServiceKernel> {
    inner: Arc<S>,
    state: Arc<OperatorState>,
}

impl<S: TalkService> UninterruptedOperator<S> {
    /// Wrap `inner`; with a `reconnect_interval`, lost speakers are re-called
    pub fn new(inner: Arc<S>, reconnect_interval: Option<Duration>) -> Self {
        Self {
            inner,
            state: Arc::new(OperatorState {
                listeners: DashMap::new(),
                relays: Mutex::new(HashSet::new()),
                backlogs: Mutex::new(HashMap::new()),
                routes: DashMap::new(),
                contacted: DashMap::new(),
                recalling: Mutex::new(HashSet::new()),
                hung_up: Mutex::new(HashSet::new()),
                reconnect_interval,
            }),
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Primitives buffered for `cellet`
    pub fn backlog_len(&self, cellet: &str) -> usize {
        lock(&self.state.backlogs)
            .get(cellet)
            .map(|entry| entry.backlog.len())
            .unwrap_or(0)
    }

    pub fn has_backlog(&self, cellet: &str) -> bool {
        lock(&self.state.backlogs).contains_key(cellet)
    }

    fn ensure_relay(&self, cellet: &str) {
        if !lock(&self.state.relays).insert(cellet.to_string()) {
            return;
        }
        let relay = RelayListener {
            cellet: cellet.to_string(),
            inner: Arc::downgrade(&self.inner),
            state: self.state.clone(),
        };
        self.inner.set_listener(cellet, Arc::new(relay));
    }
}

#[async_trait::async_trait]
impl<S: TalkService> TalkService for UninterruptedOperator<S> {
    async fn start_server(&self, host: &str, port: u16) -> TalkResult<u16> {
        self.inner.start_server(host, port).await
    }

    fn stop_server(&self, port: u16) -> bool {
        self.inner.stop_server(port)
    }

    fn stop_all_servers(&self) {
        self.inner.stop_all_servers();
    }

    fn call(&self, host: &str, port: u16, cellets: &[&str]) -> TalkResult<Arc<dyn Speakable>> {
        let addr = TalkAddr::new(host, port);
        for cellet in cellets {
            self.ensure_relay(cellet);
        }
        let speakable = self.inner.call(host, port, cellets)?;
        lock(&self.state.hung_up).remove(&addr);
        self.state
            .routes
            .entry(addr)
            .or_default()
            .extend(cellets.iter().map(|name| name.to_string()));
        Ok(speakable)
    }

    fn hangup(&self, host: &str, port: u16, now: bool) -> bool {
        let addr = TalkAddr::new(host, port);
        lock(&self.state.hung_up).insert(addr.clone());
        lock(&self.state.recalling).remove(&addr);
        self.state.contacted.remove(&addr);

        if let Some((_, names)) = self.state.routes.remove(&addr) {
            let still_routed: HashSet<String> = self
                .state
                .routes
                .iter()
                .flat_map(|entry| entry.value().clone())
                .collect();
            let mut backlogs = lock(&self.state.backlogs);
            for name in names.difference(&BTreeSet::from_iter(still_routed)) {
                if let Some(entry) = backlogs.remove(name) {
                    if !entry.backlog.is_empty() {
                        warn!("hangup discards {} buffered sends to {}", entry.backlog.len(), name);
                    }
                }
            }
        }
        self.inner.hangup(host, port, now)
    }

    fn speak(&self, cellet: &str, primitive: Primitive, ack: bool) -> bool {
        {
            let mut backlogs = lock(&self.state.backlogs);
            if let Some(entry) = backlogs.get_mut(cellet) {
                entry.backlog.push(primitive, ack);
                return true;
            }
        }
        self.inner.speak(cellet, primitive, ack)
    }

    fn set_ack_timeout(&self, timeout: Duration) {
        self.inner.set_ack_timeout(timeout);
    }

    fn ack_timeout(&self) -> Duration {
        self.inner.ack_timeout()
    }

    fn set_listener(
        &self,
        cellet: &str,
        listener: Arc<dyn TalkListener>,
    ) -> Option<Arc<dyn TalkListener>> {
        self.ensure_relay(cellet);
        let previous = self.state.listeners.insert(cellet.to_string(), listener);
        if let Some(previous) = &previous {
            previous.on_detached(cellet);
        }
        previous
    }

    fn remove_listener(&self, cellet: &str) -> Option<Arc<dyn TalkListener>> {
        let (_, previous) = self.state.listeners.remove(cellet)?;
        previous.on_detached(cellet);
        Some(previous)
    }

    fn is_called(&self, cellet: &str) -> bool {
        self.inner.is_called(cellet)
    }

    fn is_called_at(&self, host: &str, port: u16) -> bool {
        self.inner.is_called_at(host, port)
    }

    fn heartbeat_context(&self, host: &str, port: u16) -> Option<HeartbeatContext> {
        self.inner.heartbeat_context(host, port)
    }
}

impl<S: TalkService> std::fmt::Debug for UninterruptedOperator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UninterruptedOperator")
            .field("backlogs", &lock(&self.state.backlogs).len())
            .field("reconnect_interval", &self.state.reconnect_interval)
            .finish()
    }
}
