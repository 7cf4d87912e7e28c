//! Command handlers for the cellet CLI

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use cellet_core::{Primitive, Stuff, TalkAddr, TalkEvent, TalkFailure, TalkListener};
use cellet_runtime::{Nucleus, TalkService};

use crate::cli::Commands;
use crate::config::CliAppConfig;
use crate::echo::register_builtin;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command against an already loaded configuration
    pub async fn execute(command: Commands, config: CliAppConfig) -> Result<()> {
        match command {
            Commands::Serve { .. } => Self::handle_serve_command(config).await,
            Commands::Call {
                host,
                port,
                cellet,
                message,
                count,
                ack,
                linger,
            } => {
                let request = CallRequest {
                    addr: TalkAddr::new(host, port),
                    cellet,
                    message,
                    count,
                    ack,
                    linger: Duration::from_secs(linger),
                };
                Self::handle_call_command(config, request).await
            }
            Commands::Config { json } => {
                if json {
                    println!("{}", config.to_json()?);
                } else {
                    print!("{}", config.to_toml()?);
                }
                Ok(())
            }
        }
    }

    /// Host the configured cellets until ctrl-c
    async fn handle_serve_command(config: CliAppConfig) -> Result<()> {
        let nucleus = Nucleus::new(config.nucleus)?;
        register_builtin(&nucleus);

        let known = nucleus.factory_names();
        if let Some(unknown) = config.server.cellets.iter().find(|name| !known.contains(name)) {
            return Err(CliError::UnknownCellet(unknown.clone()));
        }

        let port = nucleus
            .talk_service()
            .start_server(&config.server.host, config.server.port)
            .await?;
        for name in &config.server.cellets {
            nucleus.install_registered(name, &[port])?;
        }
        println!(
            "nucleus {} serving {} on {}:{}",
            nucleus.tag(),
            config.server.cellets.join(", "),
            config.server.host,
            port
        );

        tokio::signal::ctrl_c().await?;
        info!("interrupted, shutting down");
        nucleus.shutdown();
        Ok(())
    }

    /// Speak to a remote cellet through the resilience layer and print replies
    async fn handle_call_command(config: CliAppConfig, request: CallRequest) -> Result<()> {
        let connect_wait = config.nucleus.connect_timeout() * 2;
        let nucleus = Nucleus::new(config.nucleus)?;
        let talk = nucleus.uninterrupted();

        let (listener, mut events) = EventForwarder::new();
        talk.set_listener(&request.cellet, listener);
        talk.call(&request.addr.host, request.addr.port, &[request.cellet.as_str()])?;

        Self::await_contact(&mut events, &request.addr, connect_wait).await?;
        println!("contacted {} at {}", request.cellet, request.addr);

        for i in 0..request.count {
            let primitive = Primitive::new()
                .with(Stuff::subject(request.message.as_str()))
                .with(Stuff::attributive(i as i64));
            if !talk.speak(&request.cellet, primitive, request.ack) {
                warn!("send {} to {} was refused", i, request.cellet);
            }
        }

        let deadline = Instant::now() + request.linger;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
            print_event(&event);
        }

        talk.hangup(&request.addr.host, request.addr.port, false);
        nucleus.shutdown();
        Ok(())
    }

    async fn await_contact(
        events: &mut mpsc::UnboundedReceiver<TalkEvent>,
        addr: &TalkAddr,
        wait: Duration,
    ) -> Result<()> {
        let not_contacted = |reason: String| CliError::NotContacted {
            addr: addr.to_string(),
            reason,
        };
        let deadline = Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(TalkEvent::Contacted { .. })) => return Ok(()),
                Ok(Some(TalkEvent::Failed { failure, .. })) => {
                    return Err(not_contacted(failure.to_string()))
                }
                Ok(Some(TalkEvent::Quitted { .. })) => {
                    return Err(not_contacted("quitted".to_string()))
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Err(not_contacted("listener dropped".to_string())),
                Err(_) => return Err(not_contacted(format!("no answer within {wait:?}"))),
            }
        }
    }
}

struct CallRequest {
    addr: TalkAddr,
    cellet: String,
    message: String,
    count: u32,
    ack: bool,
    linger: Duration,
}

fn print_event(event: &TalkEvent) {
    match event {
        TalkEvent::Listened { primitive, .. } => println!("< {primitive}"),
        TalkEvent::Spoke { primitive, .. } => println!("> {primitive}"),
        TalkEvent::Ack { primitive, .. } => println!("ack {primitive}"),
        TalkEvent::SpeakTimeout { primitive, .. } => println!("timeout {primitive}"),
        TalkEvent::Failed { failure, .. } => println!("failed: {failure}"),
        other => println!("{} {}", other.name(), other.cellet()),
    }
}

// ----------------------------------------------------------------------------
// Event Forwarding
// ----------------------------------------------------------------------------

/// Turns listener callbacks into `TalkEvent`s on a channel
struct EventForwarder {
    tx: mpsc::UnboundedSender<TalkEvent>,
}

impl EventForwarder {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TalkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: TalkEvent) {
        let _ = self.tx.send(event);
    }
}

impl TalkListener for EventForwarder {
    fn on_listened(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        self.send(TalkEvent::Listened {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
            primitive: primitive.clone(),
        });
    }

    fn on_spoke(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        self.send(TalkEvent::Spoke {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
            primitive: primitive.clone(),
        });
    }

    fn on_ack(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        self.send(TalkEvent::Ack {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
            primitive: primitive.clone(),
        });
    }

    fn on_speak_timeout(&self, speaker: &TalkAddr, cellet: &str, primitive: &Primitive) {
        self.send(TalkEvent::SpeakTimeout {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
            primitive: primitive.clone(),
        });
    }

    fn on_contacted(&self, speaker: &TalkAddr, cellet: &str) {
        self.send(TalkEvent::Contacted {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
        });
    }

    fn on_quitted(&self, speaker: &TalkAddr, cellet: &str) {
        self.send(TalkEvent::Quitted {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
        });
    }

    fn on_failed(&self, speaker: &TalkAddr, cellet: &str, failure: &TalkFailure) {
        self.send(TalkEvent::Failed {
            speaker: speaker.clone(),
            cellet: cellet.to_string(),
            failure: failure.clone(),
        });
    }
}
