//! Nucleus, the process root
//!
//! A `Nucleus` owns one talk kernel, one cellet kernel, the resilience
//! decorator over the talk kernel, a parameter bag and a table of cellet
//! factories. It is an ordinary value: tests create as many as they need.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cellet_core::{NucleusConfig, Primitive};
//! use cellet_runtime::{Cellet, CelletService, Nucleus, TalkContext, TalkService};
//!
//! struct Echo;
//!
//! impl Cellet for Echo {
//!     fn name(&self) -> &str {
//!         "Echo"
//!     }
//!
//!     fn on_listened(&self, service: &CelletService, context: &Arc<TalkContext>, primitive: &Primitive) {
//!         service.speak_with_ack(context, primitive.clone());
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let nucleus = Nucleus::new(NucleusConfig::default())?;
//! nucleus.register_cellet_factory("Echo", || Arc::new(Echo));
//! let port = nucleus.talk_service().start_server("0.0.0.0", 7000).await?;
//! nucleus.install_registered("Echo", &[port])?;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::sync::Arc;

use cellet_core::{NucleusConfig, NucleusTag, SessionError, TalkResult};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::cellet::Cellet;
use crate::cellet_kernel::CelletServiceKernel;
use crate::service::TalkService;
use crate::speaker::Speakable;
use crate::talk_kernel::TalkServiceKernel;
use crate::uninterrupted::UninterruptedOperator;

/// Constructor registered under a cellet name
pub type CelletFactory = Arc<dyn Fn() -> Arc<dyn Cellet> + Send + Sync>;

// ----------------------------------------------------------------------------
// Nucleus
// ----------------------------------------------------------------------------

pub struct Nucleus {
    talk: TalkServiceKernel,
    cellets: CelletServiceKernel,
    operator: Arc<UninterruptedOperator<TalkServiceKernel>>,
    params: DashMap<String, Arc<dyn Any + Send + Sync>>,
    factories: DashMap<String, CelletFactory>,
}

impl Nucleus {
    /// Create a nucleus with a freshly generated tag
    pub fn new(config: NucleusConfig) -> TalkResult<Self> {
        Self::with_tag(NucleusTag::generate(), config)
    }

    pub fn with_tag(tag: NucleusTag, config: NucleusConfig) -> TalkResult<Self> {
        config.validate()?;
        let reconnect = config.reconnect_interval();
        let talk = TalkServiceKernel::new(tag, config);
        let cellets = CelletServiceKernel::new(talk.clone());
        let operator = Arc::new(UninterruptedOperator::new(Arc::new(talk.clone()), reconnect));
        info!("nucleus {} created", talk.tag());
        Ok(Self {
            talk,
            cellets,
            operator,
            params: DashMap::new(),
            factories: DashMap::new(),
        })
    }

    pub fn tag(&self) -> &NucleusTag {
        self.talk.tag()
    }

    pub fn config(&self) -> &NucleusConfig {
        self.talk.config()
    }

    pub fn talk_service(&self) -> &TalkServiceKernel {
        &self.talk
    }

    pub fn cellet_service(&self) -> &CelletServiceKernel {
        &self.cellets
    }

    /// The talk service with reconnection resilience in front of it
    pub fn uninterrupted(&self) -> &Arc<UninterruptedOperator<TalkServiceKernel>> {
        &self.operator
    }

    // ------------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------------

    /// Store a value; returns true if it replaced one
    pub fn set_param<T: Any + Send + Sync>(&self, key: &str, value: T) -> bool {
        self.params.insert(key.to_string(), Arc::new(value)).is_some()
    }

    /// Value under `key` if it has type `T`
    pub fn param<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.params
            .get(key)
            .and_then(|entry| entry.value().downcast_ref::<T>().cloned())
    }

    pub fn remove_param(&self, key: &str) -> bool {
        self.params.remove(key).is_some()
    }

    // ------------------------------------------------------------------------
    // Cellet Factories
    // ------------------------------------------------------------------------

    pub fn register_cellet_factory<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Cellet> + Send + Sync + 'static,
    {
        if self.factories.insert(name.to_string(), Arc::new(factory)).is_some() {
            warn!("cellet factory {} replaced", name);
        }
    }

    /// Names with a registered factory, sorted
    pub fn factory_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Build a cellet from its factory, install it and activate it on `ports`
    ///
    /// If any activation fails the cellet is uninstalled again.
    pub fn install_registered(&self, name: &str, ports: &[u16]) -> TalkResult<Arc<dyn Cellet>> {
        let factory = self
            .factories
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::FactoryNotFound {
                name: name.to_string(),
            })?;
        let cellet = factory();
        let installed = cellet.name().to_string();
        if installed != name {
            warn!("factory {} built cellet named {}", name, installed);
        }

        self.cellets.install(cellet.clone())?;
        for port in ports {
            if let Err(e) = self.cellets.activate(*port, &installed) {
                self.cellets.uninstall(&installed);
                return Err(e);
            }
        }
        Ok(cellet)
    }

    /// Hang up every speaker and stop every server
    pub fn shutdown(&self) {
        let names: Vec<String> = self
            .cellets
            .get_cellets()
            .iter()
            .map(|cellet| cellet.name().to_string())
            .collect();
        for name in names {
            self.cellets.uninstall(&name);
        }
        for speaker in self.talk.speakers() {
            let addr = speaker.addr().clone();
            self.operator.hangup(&addr.host, addr.port, false);
        }
        self.talk.stop_all_servers();
        info!("nucleus {} shut down", self.tag());
    }
}

impl std::fmt::Debug for Nucleus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nucleus")
            .field("tag", self.tag())
            .field("params", &self.params.len())
            .field("factories", &self.factories.len())
            .finish()
    }
}
