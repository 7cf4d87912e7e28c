//! Error handling for the cellet CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Talk error: {0}")]
    Talk(#[from] cellet_core::TalkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown cellet factory: {0}")]
    UnknownCellet(String),

    #[error("Call to {addr} was not contacted: {reason}")]
    NotContacted { addr: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Loading(String),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Failed to serialize configuration: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Failed to serialize configuration as JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
