//! Cellets shipped with the CLI

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cellet_core::{Primitive, Stuff};
use cellet_runtime::{Cellet, CelletService, Nucleus, TalkContext};
use tracing::{debug, info};

/// Sends every primitive it hears back to the sender, asking for an ack
#[derive(Default)]
pub struct EchoCellet {
    echoed: AtomicU64,
}

impl EchoCellet {
    pub const NAME: &'static str = "Echo";

    pub fn echoed(&self) -> u64 {
        self.echoed.load(Ordering::Relaxed)
    }
}

impl Cellet for EchoCellet {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_contacted(&self, _service: &CelletService, context: &Arc<TalkContext>) {
        info!("{} contacted from {}", Self::NAME, context.remote());
    }

    fn on_listened(&self, service: &CelletService, context: &Arc<TalkContext>, primitive: &Primitive) {
        debug!("{} heard {} from {}", Self::NAME, primitive, context.remote());
        let seq = self.echoed.fetch_add(1, Ordering::Relaxed) + 1;
        let reply = primitive.clone().with(Stuff::adverbial(seq as i64));
        service.speak_with_ack(context, reply);
    }

    fn on_speak_timeout(&self, _service: &CelletService, context: &Arc<TalkContext>, primitive: &Primitive) {
        info!("echo of {} to {} was not acknowledged", primitive, context.remote());
    }

    fn on_quitted(&self, _service: &CelletService, context: &Arc<TalkContext>) {
        info!("{} quitted by {}", Self::NAME, context.remote());
    }
}

/// Register every shipped cellet with `nucleus`
pub fn register_builtin(nucleus: &Nucleus) {
    nucleus.register_cellet_factory(EchoCellet::NAME, || Arc::new(EchoCellet::default()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellet_core::{NucleusConfig, StuffKind, TalkAddr, TalkListener};
    use cellet_runtime::TalkService;
    use tokio::sync::mpsc;

    struct Replies(mpsc::UnboundedSender<Primitive>);

    impl TalkListener for Replies {
        fn on_listened(&self, _speaker: &TalkAddr, _cellet: &str, primitive: &Primitive) {
            let _ = self.0.send(primitive.clone());
        }
    }

    #[tokio::test]
    async fn test_echo_numbers_its_replies() {
        let server = Nucleus::new(NucleusConfig::testing()).unwrap();
        register_builtin(&server);
        let port = server.talk_service().start_server("127.0.0.1", 0).await.unwrap();
        assert!(server.install_registered(EchoCellet::NAME, &[port]).is_ok());

        let client = Nucleus::new(NucleusConfig::testing()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.talk_service().set_listener("Echo", Arc::new(Replies(tx)));
        client.talk_service().call("127.0.0.1", port, &["Echo"]).unwrap();

        // speak succeeds once the handshake completes
        let mut sent = 0;
        while sent < 2 {
            if client
                .talk_service()
                .speak_with_ack("Echo", Primitive::new().with(Stuff::subject("hi")))
            {
                sent += 1;
            } else {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }

        for expected in 1..=2i64 {
            let reply = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(reply.subjects().next().and_then(|l| l.as_str()), Some("hi"));
            let seq = reply.of_kind(StuffKind::Adverbial).next().and_then(|l| l.as_i64());
            assert_eq!(seq, Some(expected));
        }
        server.shutdown();
    }
}
