//! Cellets, the named server-side handlers
//!
//! A cellet is installed into a [`CelletServiceKernel`] and activated on one
//! or more listening ports. While it is active the kernel hands it a
//! [`CelletService`] handle in every callback; the handle is how a cellet
//! speaks to or hangs up on the contexts that talk to it.

use std::sync::{Arc, Weak};

use cellet_core::Primitive;
use tracing::warn;

use crate::cellet_kernel::{CelletKernelInner, CelletServiceKernel};
use crate::context::TalkContext;

// ----------------------------------------------------------------------------
// Cellet Trait
// ----------------------------------------------------------------------------

/// A named service hosted by a nucleus
///
/// Callbacks run on the context's dispatch task and should return quickly.
#[allow(unused_variables)]
pub trait Cellet: Send + Sync + 'static {
    /// Unique name within a nucleus
    fn name(&self) -> &str;

    /// Installation hook; returning false aborts the install
    fn install(&self) -> bool {
        true
    }

    fn uninstall(&self) {}

    /// A client declared this cellet in its handshake
    fn on_contacted(&self, service: &CelletService, context: &Arc<TalkContext>) {}

    fn on_listened(&self, service: &CelletService, context: &Arc<TalkContext>, primitive: &Primitive);

    fn on_ack(&self, service: &CelletService, context: &Arc<TalkContext>, primitive: &Primitive) {}

    fn on_speak_timeout(
        &self,
        service: &CelletService,
        context: &Arc<TalkContext>,
        primitive: &Primitive,
    ) {
    }

    /// The context closed, or the cellet was deactivated on its server
    fn on_quitted(&self, service: &CelletService, context: &Arc<TalkContext>) {}
}

// ----------------------------------------------------------------------------
// Cellet Service Handle
// ----------------------------------------------------------------------------

/// Handle from an active cellet back to its kernel
///
/// Holds no strong reference; once the kernel is gone or the cellet has
/// been deactivated everywhere, every call fails fast.
#[derive(Clone)]
pub struct CelletService {
    name: String,
    kernel: Weak<CelletKernelInner>,
}

impl CelletService {
    pub(crate) fn new(name: String, kernel: Weak<CelletKernelInner>) -> Self {
        Self { name, kernel }
    }

    pub fn cellet_name(&self) -> &str {
        &self.name
    }

    fn kernel(&self) -> Option<CelletServiceKernel> {
        let kernel = self.kernel.upgrade().map(CelletServiceKernel::from_inner);
        if kernel.is_none() {
            warn!("cellet {} used after its kernel was dropped", self.name);
        }
        kernel
    }

    pub fn speak(&self, context: &Arc<TalkContext>, primitive: Primitive, ack: bool) -> bool {
        self.kernel()
            .map(|kernel| kernel.speak(&self.name, context, primitive, ack))
            .unwrap_or(false)
    }

    pub fn speak_with_ack(&self, context: &Arc<TalkContext>, primitive: Primitive) -> bool {
        self.speak(context, primitive, true)
    }

    pub fn speak_without_ack(&self, context: &Arc<TalkContext>, primitive: Primitive) -> bool {
        self.speak(context, primitive, false)
    }

    pub fn hangup(&self, context: &Arc<TalkContext>, now: bool) -> bool {
        self.kernel()
            .map(|kernel| kernel.hangup(&self.name, context, now))
            .unwrap_or(false)
    }

    /// Live contexts on every server this cellet is active on
    pub fn contexts(&self) -> Vec<Arc<TalkContext>> {
        self.kernel()
            .map(|kernel| kernel.get_all_context(&self.name))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for CelletService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CelletService")
            .field("name", &self.name)
            .field("attached", &(self.kernel.strong_count() > 0))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------------

/// A cellet bound as a routable destination on a server
#[derive(Clone)]
pub(crate) struct CelletRoute {
    pub cellet: Arc<dyn Cellet>,
    pub service: CelletService,
}

/// Server-side event for one cellet on one context
#[derive(Debug, Clone)]
pub(crate) enum CelletEvent {
    Contacted,
    Listened(Primitive),
    Ack(Primitive),
    SpeakTimeout(Primitive),
    Quitted,
}

impl CelletRoute {
    pub fn name(&self) -> &str {
        self.service.cellet_name()
    }

    pub fn deliver(&self, context: &Arc<TalkContext>, event: CelletEvent) {
        let service = &self.service;
        match event {
            CelletEvent::Contacted => self.cellet.on_contacted(service, context),
            CelletEvent::Listened(primitive) => self.cellet.on_listened(service, context, &primitive),
            CelletEvent::Ack(primitive) => self.cellet.on_ack(service, context, &primitive),
            CelletEvent::SpeakTimeout(primitive) => {
                self.cellet.on_speak_timeout(service, context, &primitive)
            }
            CelletEvent::Quitted => self.cellet.on_quitted(service, context),
        }
    }
}
