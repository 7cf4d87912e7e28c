//! Talk Service Trait Definition
//!
//! The session API shared by [`TalkServiceKernel`](crate::TalkServiceKernel)
//! and decorators layered over it such as
//! [`UninterruptedOperator`](crate::UninterruptedOperator).

use std::sync::Arc;
use std::time::Duration;

use cellet_core::{HeartbeatContext, Primitive, TalkListener, TalkResult};

use crate::speaker::Speakable;

// ----------------------------------------------------------------------------
// Talk Service Trait
// ----------------------------------------------------------------------------

/// Session API of a nucleus
///
/// ## Delivery
///
/// `speak` never blocks on the network. A `true` result means the primitive
/// was accepted for delivery; the outcome arrives through the cellet's
/// listener as `on_spoke`, `on_ack` or `on_speak_timeout`.
///
/// ## Listeners
///
/// Exactly one listener is registered per cellet name. Registering another
/// replaces the first, which is returned and told through `on_detached`.
#[async_trait::async_trait]
pub trait TalkService: Send + Sync + 'static {
    /// Start a server; port 0 binds an ephemeral port. Returns the bound port.
    async fn start_server(&self, host: &str, port: u16) -> TalkResult<u16>;

    fn stop_server(&self, port: u16) -> bool;

    /// Stop every server; idempotent
    fn stop_all_servers(&self);

    /// Connect to `host:port` and declare `cellets` on the connection
    ///
    /// At most one connection exists per (host, port); calling again with
    /// new names re-declares them on the open connection.
    fn call(&self, host: &str, port: u16, cellets: &[&str]) -> TalkResult<Arc<dyn Speakable>>;

    /// Close the connection to `host:port`; `now` skips draining queued bytes
    fn hangup(&self, host: &str, port: u16, now: bool) -> bool;

    fn speak(&self, cellet: &str, primitive: Primitive, ack: bool) -> bool;

    fn speak_with_ack(&self, cellet: &str, primitive: Primitive) -> bool {
        self.speak(cellet, primitive, true)
    }

    fn speak_without_ack(&self, cellet: &str, primitive: Primitive) -> bool {
        self.speak(cellet, primitive, false)
    }

    fn set_ack_timeout(&self, timeout: Duration);

    fn ack_timeout(&self) -> Duration;

    fn set_listener(
        &self,
        cellet: &str,
        listener: Arc<dyn TalkListener>,
    ) -> Option<Arc<dyn TalkListener>>;

    fn remove_listener(&self, cellet: &str) -> Option<Arc<dyn TalkListener>>;

    /// Whether some live speaker has `cellet` contacted
    fn is_called(&self, cellet: &str) -> bool;

    /// Whether a live connection to `host:port` exists
    fn is_called_at(&self, host: &str, port: u16) -> bool;

    /// Cellet names declared on a speaker
    fn get_cellets(&self, speaker: &dyn Speakable) -> Vec<String> {
        speaker.cellets().into_vec()
    }

    fn heartbeat_context(&self, host: &str, port: u16) -> Option<HeartbeatContext>;
}
