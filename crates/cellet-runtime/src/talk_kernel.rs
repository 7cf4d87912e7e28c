//! Talk service kernel
//!
//! Owns every server and speaker of a nucleus, the listener registry and the
//! ack-timeout policy. Cheap to clone; all clones share one kernel.

use std::sync::Arc;
use std::time::Duration;

use cellet_core::{
    HeartbeatContext, NucleusConfig, NucleusTag, Primitive, SessionError, TalkAddr, TalkListener,
    TalkResult,
};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::env::TalkEnv;
use crate::server::{BaseServer, Servable};
use crate::service::TalkService;
use crate::speaker::{Speakable, Speaker, SpeakerState};

struct TalkKernelInner {
    env: Arc<TalkEnv>,
    speakers: DashMap<TalkAddr, Arc<Speaker>>,
    servers: DashMap<u16, Arc<BaseServer>>,
}

#[derive(Clone)]
pub struct TalkServiceKernel {
    inner: Arc<TalkKernelInner>,
}

impl TalkServiceKernel {
    pub fn new(tag: NucleusTag, config: NucleusConfig) -> Self {
        Self {
            inner: Arc::new(TalkKernelInner {
                env: TalkEnv::new(tag, config),
                speakers: DashMap::new(),
                servers: DashMap::new(),
            }),
        }
    }

    pub(crate) fn env(&self) -> &Arc<TalkEnv> {
        &self.inner.env
    }

    pub fn tag(&self) -> &NucleusTag {
        &self.inner.env.tag
    }

    pub fn config(&self) -> &NucleusConfig {
        &self.inner.env.config
    }

    pub fn server(&self, port: u16) -> Option<Arc<BaseServer>> {
        self.inner.servers.get(&port).map(|entry| entry.value().clone())
    }

    pub fn servers(&self) -> Vec<Arc<BaseServer>> {
        self.inner
            .servers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn speaker(&self, host: &str, port: u16) -> Option<Arc<Speaker>> {
        self.inner
            .speakers
            .get(&TalkAddr::new(host, port))
            .map(|entry| entry.value().clone())
    }

    pub fn speakers(&self) -> Vec<Arc<Speaker>> {
        self.inner
            .speakers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Hang up every speaker
    pub fn hangup_all(&self, now: bool) {
        let addrs: Vec<TalkAddr> = self.inner.speakers.iter().map(|e| e.key().clone()).collect();
        for addr in addrs {
            self.hangup(&addr.host, addr.port, now);
        }
    }
}

#[async_trait::async_trait]
impl TalkService for TalkServiceKernel {
    async fn start_server(&self, host: &str, port: u16) -> TalkResult<u16> {
        if port != 0 && self.inner.servers.contains_key(&port) {
            return Err(SessionError::ServerAlreadyRunning { port }.into());
        }
        let server = BaseServer::bind(host, port, self.inner.env.clone()).await?;
        let bound = server.port();
        if let Some(previous) = self.inner.servers.insert(bound, server) {
            // lost a race with a concurrent start on the same port
            previous.stop();
        }
        Ok(bound)
    }

    fn stop_server(&self, port: u16) -> bool {
        match self.inner.servers.remove(&port) {
            Some((_, server)) => {
                server.stop();
                true
            }
            None => false,
        }
    }

    fn stop_all_servers(&self) {
        let ports: Vec<u16> = self.inner.servers.iter().map(|e| *e.key()).collect();
        for port in ports {
            self.stop_server(port);
        }
    }

    fn call(&self, host: &str, port: u16, cellets: &[&str]) -> TalkResult<Arc<dyn Speakable>> {
        let addr = TalkAddr::new(host, port);
        if cellets.is_empty() {
            return Err(SessionError::NoCellets {
                addr: addr.to_string(),
            }
            .into());
        }
        let speaker = self
            .inner
            .speakers
            .entry(addr.clone())
            .or_insert_with(|| Speaker::new(addr, self.inner.env.clone()))
            .value()
            .clone();

        let names: Vec<String> = cellets.iter().map(|name| name.to_string()).collect();
        speaker.call(&names);
        Ok(speaker)
    }

    fn hangup(&self, host: &str, port: u16, now: bool) -> bool {
        match self.inner.speakers.remove(&TalkAddr::new(host, port)) {
            Some((_, speaker)) => {
                speaker.hangup(now);
                true
            }
            None => false,
        }
    }

    fn speak(&self, cellet: &str, primitive: Primitive, ack: bool) -> bool {
        let speaker = self
            .inner
            .speakers
            .iter()
            .map(|entry| entry.value().clone())
            .find(|speaker| speaker.state() == SpeakerState::Active && speaker.is_contacted(cellet));
        match speaker {
            Some(speaker) => speaker.speak(cellet, primitive, ack, self.inner.env.ack_timeout()),
            None => {
                debug!("no active speaker has {} contacted", cellet);
                false
            }
        }
    }

    fn set_ack_timeout(&self, timeout: Duration) {
        self.inner.env.set_ack_timeout(timeout);
    }

    fn ack_timeout(&self) -> Duration {
        self.inner.env.ack_timeout()
    }

    fn set_listener(
        &self,
        cellet: &str,
        listener: Arc<dyn TalkListener>,
    ) -> Option<Arc<dyn TalkListener>> {
        let previous = self.inner.env.listeners.insert(cellet.to_string(), listener);
        if let Some(previous) = &previous {
            info!("listener for {} replaced", cellet);
            previous.on_detached(cellet);
        }
        previous
    }

    fn remove_listener(&self, cellet: &str) -> Option<Arc<dyn TalkListener>> {
        let (_, previous) = self.inner.env.listeners.remove(cellet)?;
        previous.on_detached(cellet);
        Some(previous)
    }

    fn is_called(&self, cellet: &str) -> bool {
        self.inner
            .speakers
            .iter()
            .any(|entry| entry.value().is_contacted(cellet))
    }

    fn is_called_at(&self, host: &str, port: u16) -> bool {
        self.speaker(host, port)
            .is_some_and(|speaker| speaker.state().is_live())
    }

    fn heartbeat_context(&self, host: &str, port: u16) -> Option<HeartbeatContext> {
        self.inner.env.heartbeat.context(&TalkAddr::new(host, port))
    }
}

impl std::fmt::Debug for TalkServiceKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TalkServiceKernel")
            .field("tag", self.tag())
            .field("servers", &self.inner.servers.len())
            .field("speakers", &self.inner.speakers.len())
            .finish()
    }
}
