//! Cellet registry and server-side dispatch
//!
//! The kernel maps cellet names to their instances and to the servers they are
//! active on. Outbound sends from a cellet are resolved to the server that
//! accepted the target context before they reach the wire.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use cellet_core::{Primitive, ServerId, SessionError, TalkResult};
use tracing::{debug, info, warn};

use crate::cellet::{Cellet, CelletRoute, CelletService};
use crate::context::TalkContext;
use crate::server::Servable;
use crate::sync::{read, write};
use crate::talk_kernel::TalkServiceKernel;

/// Per-cellet kernel state
struct CelletSlot {
    cellet: Arc<dyn Cellet>,
    /// Ports in activation order, parallel to `servers`
    work_ports: Vec<u16>,
    servers: Vec<ServerId>,
    /// Set while `servers` is non-empty
    service: Option<CelletService>,
}

pub(crate) struct CelletKernelInner {
    talk: TalkServiceKernel,
    slots: RwLock<HashMap<String, CelletSlot>>,
}

/// Registry of installed cellets
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct CelletServiceKernel {
    inner: Arc<CelletKernelInner>,
}

impl CelletServiceKernel {
    pub fn new(talk: TalkServiceKernel) -> Self {
        Self {
            inner: Arc::new(CelletKernelInner {
                talk,
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<CelletKernelInner>) -> Self {
        Self { inner }
    }

    pub fn talk_kernel(&self) -> &TalkServiceKernel {
        &self.inner.talk
    }

    // ------------------------------------------------------------------------
    // Installation
    // ------------------------------------------------------------------------

    /// Register a cellet after its `install` hook agrees
    pub fn install(&self, cellet: Arc<dyn Cellet>) -> TalkResult<()> {
        let name = cellet.name().to_string();
        if read(&self.inner.slots).contains_key(&name) {
            return Err(SessionError::CelletAlreadyInstalled { name }.into());
        }
        if !cellet.install() {
            warn!("cellet {} refused installation", name);
            return Err(SessionError::CelletInstallRefused { name }.into());
        }

        let mut slots = write(&self.inner.slots);
        if slots.contains_key(&name) {
            drop(slots);
            cellet.uninstall();
            return Err(SessionError::CelletAlreadyInstalled { name }.into());
        }
        slots.insert(
            name.clone(),
            CelletSlot {
                cellet,
                work_ports: Vec::new(),
                servers: Vec::new(),
                service: None,
            },
        );
        info!("installed cellet {}", name);
        Ok(())
    }

    /// Deactivate a cellet everywhere, run its `uninstall` hook and forget it
    pub fn uninstall(&self, name: &str) -> bool {
        let ports = match read(&self.inner.slots).get(name) {
            Some(slot) => slot.work_ports.clone(),
            None => return false,
        };
        for port in ports {
            self.deactivate(port, name);
        }
        let Some(slot) = write(&self.inner.slots).remove(name) else {
            return false;
        };
        slot.cellet.uninstall();
        info!("uninstalled cellet {}", name);
        true
    }

    pub fn get_cellet(&self, name: &str) -> Option<Arc<dyn Cellet>> {
        read(&self.inner.slots).get(name).map(|slot| slot.cellet.clone())
    }

    /// Installed cellets ordered by name
    pub fn get_cellets(&self) -> Vec<Arc<dyn Cellet>> {
        let slots = read(&self.inner.slots);
        let ordered: BTreeMap<&String, &CelletSlot> = slots.iter().collect();
        ordered.values().map(|slot| slot.cellet.clone()).collect()
    }

    pub fn work_ports(&self, name: &str) -> Vec<u16> {
        read(&self.inner.slots)
            .get(name)
            .map(|slot| slot.work_ports.clone())
            .unwrap_or_default()
    }

    /// Whether the cellet currently holds a service binding
    pub fn is_bound(&self, name: &str) -> bool {
        read(&self.inner.slots)
            .get(name)
            .is_some_and(|slot| slot.service.is_some())
    }

    // ------------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------------

    /// Make a cellet routable on the server listening on `port`
    pub fn activate(&self, port: u16, name: &str) -> TalkResult<()> {
        let server = self
            .inner
            .talk
            .server(port)
            .ok_or(SessionError::ServerNotListening { port })?;

        let mut slots = write(&self.inner.slots);
        let slot = slots.get_mut(name).ok_or_else(|| SessionError::CelletNotInstalled {
            name: name.to_string(),
        })?;

        if let Some(index) = slot.work_ports.iter().position(|p| *p == port) {
            if slot.servers[index] == server.id() {
                debug!("{} already active on port {}", name, port);
                return Ok(());
            }
            // the server on this port was restarted since activation
            slot.work_ports.remove(index);
            slot.servers.remove(index);
        }

        let service = slot
            .service
            .get_or_insert_with(|| CelletService::new(name.to_string(), Arc::downgrade(&self.inner)))
            .clone();
        server.bind_cellet(CelletRoute {
            cellet: slot.cellet.clone(),
            service,
        });
        slot.work_ports.push(port);
        slot.servers.push(server.id());
        info!("activated {} on port {}", name, port);
        Ok(())
    }

    /// Stop routing a cellet on `port`; false if it was not active there
    pub fn deactivate(&self, port: u16, name: &str) -> bool {
        {
            let mut slots = write(&self.inner.slots);
            let Some(slot) = slots.get_mut(name) else {
                return false;
            };
            let Some(index) = slot.work_ports.iter().position(|p| *p == port) else {
                return false;
            };
            slot.work_ports.remove(index);
            slot.servers.remove(index);
            if slot.servers.is_empty() {
                slot.service = None;
            }
        }

        if let Some(server) = self.inner.talk.server(port) {
            server.unbind_cellet(name);
        }
        info!("deactivated {} on port {}", name, port);
        true
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Send through the server that accepted `context`
    ///
    /// Returns false without I/O when the cellet has no binding, the context
    /// belongs to a server the cellet is not active on, or the context is locked.
    pub fn speak(&self, name: &str, context: &Arc<TalkContext>, primitive: Primitive, ack: bool) -> bool {
        if !self.has_binding(name, "speak") {
            return false;
        }
        let server = match self.inner.talk.server(context.port()) {
            Some(server) if server.id() == context.server_id() => server,
            _ => {
                warn!(
                    "{} speaks through {} after its server on port {} stopped",
                    name,
                    context.session_id(),
                    context.port()
                );
                return false;
            }
        };
        let Some(route) = server.route(name) else {
            debug!("{} is not routable on port {}", name, context.port());
            return false;
        };
        context.speak(&route, primitive, ack, self.inner.talk.env().ack_timeout())
    }

    /// Lock `context`, then close its connection
    pub fn hangup(&self, name: &str, context: &Arc<TalkContext>, now: bool) -> bool {
        if !self.has_binding(name, "hangup") {
            return false;
        }
        context.hangup(now);
        true
    }

    /// Live contexts across every server the cellet is active on
    pub fn get_all_context(&self, name: &str) -> Vec<Arc<TalkContext>> {
        let ports = self.work_ports(name);
        let mut seen = BTreeMap::new();
        for port in ports {
            if let Some(server) = self.inner.talk.server(port) {
                for context in server.contexts() {
                    seen.entry(context.session_id()).or_insert(context);
                }
            }
        }
        seen.into_values().collect()
    }

    fn has_binding(&self, name: &str, operation: &str) -> bool {
        let bound = self.is_bound(name);
        if !bound {
            warn!("{} on cellet {} without an active service binding", operation, name);
        }
        bound
    }
}

impl std::fmt::Debug for CelletServiceKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CelletServiceKernel")
            .field("cellets", &read(&self.inner.slots).len())
            .finish()
    }
}

