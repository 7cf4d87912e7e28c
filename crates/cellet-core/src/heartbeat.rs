//! Heartbeat liveness tracking
//!
//! A [`HeartbeatMachine`] keeps one [`HeartbeatContext`] per (host, port).
//! Inbound traffic of any kind refreshes the context. Ticks apply a fixed
//! two-strike policy: after one interval of silence the peer is probed, after
//! two it is declared dead. Time is passed in by the host so the policy is
//! testable without a clock.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::types::TalkAddr;

// ----------------------------------------------------------------------------
// Heartbeat Context
// ----------------------------------------------------------------------------

/// Liveness record for one remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatContext {
    pub addr: TalkAddr,
    pub created_at: Instant,
    pub last_seen: Instant,
    pub last_probe: Option<Instant>,
    pub probes_sent: u32,
    pub failed: bool,
}

impl HeartbeatContext {
    pub fn new(addr: TalkAddr, now: Instant) -> Self {
        Self {
            addr,
            created_at: now,
            last_seen: now,
            last_probe: None,
            probes_sent: 0,
            failed: false,
        }
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    fn touch(&mut self, now: Instant) {
        if now > self.last_seen {
            self.last_seen = now;
        }
        self.last_probe = None;
    }
}

/// What the host must do for a context after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a liveness probe
    Probe,
    /// Declare the connection failed and tear it down
    Fail,
}

// ----------------------------------------------------------------------------
// Heartbeat Machine
// ----------------------------------------------------------------------------

/// Two-strike liveness policy over all tracked endpoints
#[derive(Debug)]
pub struct HeartbeatMachine {
    interval: Duration,
    contexts: HashMap<TalkAddr, HeartbeatContext>,
}

impl HeartbeatMachine {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            contexts: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start tracking an endpoint, replacing any previous record
    pub fn register(&mut self, addr: TalkAddr, now: Instant) {
        self.contexts
            .insert(addr.clone(), HeartbeatContext::new(addr, now));
    }

    /// Record inbound traffic; returns false for unknown endpoints
    pub fn touch(&mut self, addr: &TalkAddr, now: Instant) -> bool {
        match self.contexts.get_mut(addr) {
            Some(context) => {
                context.touch(now);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, addr: &TalkAddr) -> Option<HeartbeatContext> {
        self.contexts.remove(addr)
    }

    pub fn context(&self, addr: &TalkAddr) -> Option<&HeartbeatContext> {
        self.contexts.get(addr)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Inspect every context and return the actions due at `now`
    ///
    /// `Fail` is reported at most once per context.
    pub fn tick(&mut self, now: Instant) -> SmallVec<[(TalkAddr, HeartbeatAction); 4]> {
        let mut actions = SmallVec::new();
        let fail_after = self.interval * 2;

        for context in self.contexts.values_mut() {
            if context.failed {
                continue;
            }
            let silence = context.silence(now);
            if silence > fail_after {
                context.failed = true;
                actions.push((context.addr.clone(), HeartbeatAction::Fail));
            } else if silence > self.interval && context.last_probe.is_none() {
                context.last_probe = Some(now);
                context.probes_sent += 1;
                actions.push((context.addr.clone(), HeartbeatAction::Probe));
            }
        }

        actions
    }
}
