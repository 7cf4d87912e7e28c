//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    pub heartbeat_ms: Option<u64>,

    /// Ack timeout in milliseconds
    #[arg(long)]
    pub ack_timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Host cellets on a listening port until interrupted
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to bind
        #[arg(short, long)]
        port: Option<u16>,
        /// Cellets to install, by factory name
        #[arg(long = "cellet")]
        cellets: Vec<String>,
    },
    /// Speak to a remote cellet and print what comes back
    Call {
        /// Remote host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Remote port
        #[arg(short, long)]
        port: u16,
        /// Cellet to address
        #[arg(long, default_value = "Echo")]
        cellet: String,
        /// Message text
        message: String,
        /// Number of times to send the message
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
        /// Request an ack for every send
        #[arg(long)]
        ack: bool,
        /// Seconds to keep listening after the last send
        #[arg(long, default_value_t = 2)]
        linger: u64,
    },
    /// Print the effective configuration
    Config {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}
