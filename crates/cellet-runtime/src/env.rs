//! Shared environment of one talk kernel
//!
//! Speakers, servers and connections hold an `Arc<TalkEnv>` instead of a
//! reference back to the kernel that created them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cellet_core::{NucleusConfig, NucleusTag, TalkListener};
use dashmap::DashMap;

use crate::heartbeat::HeartbeatDriver;

pub(crate) struct TalkEnv {
    pub tag: NucleusTag,
    pub config: NucleusConfig,
    ack_timeout_ms: AtomicU64,
    next_id: AtomicU64,
    pub listeners: DashMap<String, Arc<dyn TalkListener>>,
    pub heartbeat: Arc<HeartbeatDriver>,
}

impl TalkEnv {
    pub fn new(tag: NucleusTag, config: NucleusConfig) -> Arc<Self> {
        let heartbeat = HeartbeatDriver::new(config.heartbeat(), config.heartbeat_tick());
        Arc::new(Self {
            tag,
            ack_timeout_ms: AtomicU64::new(config.ack_timeout_ms),
            config,
            next_id: AtomicU64::new(1),
            listeners: DashMap::new(),
            heartbeat,
        })
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_ack_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        self.ack_timeout_ms.store(millis, Ordering::Relaxed);
    }

    /// Process-unique id for connections and servers
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Listener for a cellet, cloned out so no map guard is held during callbacks
    pub fn listener(&self, cellet: &str) -> Option<Arc<dyn TalkListener>> {
        self.listeners.get(cellet).map(|entry| entry.value().clone())
    }
}
