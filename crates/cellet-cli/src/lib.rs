//! Cellet CLI library
//!
//! Components of the `cellet` binary: argument parsing, layered
//! configuration, the built-in cellets and the command handlers.

pub mod cli;
pub mod commands;
pub mod config;
pub mod echo;
pub mod error;

pub use cli::{Cli, Commands};
pub use config::{CliAppConfig, ConfigOverrides};
pub use echo::EchoCellet;
pub use error::{CliError, ConfigError, Result};
