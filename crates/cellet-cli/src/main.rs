//! Cellet CLI entry point

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use cellet_cli::{
    cli::{Cli, Commands},
    commands::CommandDispatcher,
    config::{CliAppConfig, ConfigOverrides},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let overrides = overrides_from(&cli);
    let config = CliAppConfig::load(cli.config.as_deref().map(Path::new), &overrides)
        .context("loading configuration")?;

    CommandDispatcher::execute(cli.command, config)
        .await
        .context("command failed")?;

    info!("cellet exited");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Flags that take precedence over every configuration layer
fn overrides_from(cli: &Cli) -> ConfigOverrides {
    let mut overrides = ConfigOverrides {
        heartbeat_ms: cli.heartbeat_ms,
        ack_timeout_ms: cli.ack_timeout_ms,
        ..ConfigOverrides::default()
    };
    if let Commands::Serve {
        host,
        port,
        cellets,
    } = &cli.command
    {
        overrides.host = host.clone();
        overrides.port = *port;
        if !cellets.is_empty() {
            overrides.cellets = Some(cellets.clone());
        }
    }
    overrides
}
