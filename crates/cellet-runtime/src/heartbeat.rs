//! Heartbeat driver
//!
//! Owns the kernel's `HeartbeatMachine` and a single ticker task. Readers
//! report traffic through `touch`; the ticker sends probes and tears down
//! connections that stayed silent for two intervals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use cellet_core::{Frame, HeartbeatAction, HeartbeatContext, HeartbeatMachine, TalkAddr};
use dashmap::DashMap;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::connection::{CloseCause, Connection};
use crate::sync::lock;

/// Current time from tokio's clock, so paused-time tests drive liveness too
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub(crate) struct HeartbeatDriver {
    machine: Mutex<HeartbeatMachine>,
    connections: DashMap<TalkAddr, Weak<Connection>>,
    tick: Duration,
    started: AtomicBool,
}

impl HeartbeatDriver {
    pub fn new(interval: Duration, tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            machine: Mutex::new(HeartbeatMachine::new(interval)),
            connections: DashMap::new(),
            tick,
            started: AtomicBool::new(false),
        })
    }

    /// Track a freshly opened connection
    pub fn register(self: &Arc<Self>, connection: &Arc<Connection>) {
        let addr = connection.remote().clone();
        lock(&self.machine).register(addr.clone(), now());
        self.connections.insert(addr, Arc::downgrade(connection));
        self.ensure_ticker();
    }

    pub fn touch(&self, addr: &TalkAddr) {
        lock(&self.machine).touch(addr, now());
    }

    /// Stop tracking a connection unless a newer one took over its address
    pub fn unregister(&self, connection: &Connection) {
        let removed = self
            .connections
            .remove_if(connection.remote(), |_, weak| match weak.upgrade() {
                Some(current) => current.id() == connection.id(),
                None => true,
            })
            .is_some();
        if removed {
            lock(&self.machine).remove(connection.remote());
        }
    }

    pub fn context(&self, addr: &TalkAddr) -> Option<HeartbeatContext> {
        lock(&self.machine).context(addr).cloned()
    }

    fn ensure_ticker(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = self.tick;
        tokio::spawn(async move {
            debug!("heartbeat ticker starting (every {:?})", period);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(driver) = weak.upgrade() else {
                    break;
                };
                driver.run_tick(now());
            }
            debug!("heartbeat ticker stopped");
        });
    }

    pub(crate) fn run_tick(&self, at: Instant) {
        let actions = lock(&self.machine).tick(at);
        for (addr, action) in actions {
            let connection = self
                .connections
                .get(&addr)
                .and_then(|entry| entry.value().upgrade());
            let Some(connection) = connection else {
                lock(&self.machine).remove(&addr);
                continue;
            };
            match action {
                HeartbeatAction::Probe => {
                    trace!("probing silent peer {}", addr);
                    connection.send_frame(&Frame::Heartbeat);
                }
                HeartbeatAction::Fail => {
                    warn!("{} silent for two heartbeat intervals, closing", addr);
                    connection.abort(CloseCause::HeartbeatTimeout);
                }
            }
        }
    }
}
