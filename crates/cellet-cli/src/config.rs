//! Cellet CLI Configuration Management
//!
//! Configuration is layered with figment, lowest priority first:
//! - built-in defaults
//! - `cellet.toml` in the current directory, then the user config file
//! - a file named with `--config`
//! - environment variables (`CELLET_*`, nested keys split on `__`)
//! - command line flags
//!
//! For example `CELLET_NUCLEUS__HEARTBEAT_MS=5000` sets `nucleus.heartbeat_ms`.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use cellet_core::NucleusConfig;

use crate::error::ConfigError;

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the cellet CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliAppConfig {
    /// Nucleus tunables shared by both subcommands
    pub nucleus: NucleusConfig,

    /// Settings for `cellet serve`
    pub server: ServerConfig,
}

/// Where `serve` listens and what it hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Factory names installed at startup
    pub cellets: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7000,
            cellets: vec!["Echo".to_string()],
        }
    }
}

impl Default for CliAppConfig {
    fn default() -> Self {
        let nucleus = NucleusConfig {
            work_path: default_work_path(),
            ..NucleusConfig::default()
        };
        Self {
            nucleus,
            server: ServerConfig::default(),
        }
    }
}

fn default_work_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("cellet"))
        .unwrap_or_else(|| PathBuf::from("."))
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

/// Values taken from command line flags
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub heartbeat_ms: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cellets: Option<Vec<String>>,
}

impl CliAppConfig {
    /// Load with the standard priority order and validate the result
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("cellet.toml"));

        if let Some(user_path) = Self::default_config_path() {
            figment = figment.merge(Toml::file(user_path));
        }

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Loading(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("CELLET_").split("__"));

        if let Some(v) = overrides.heartbeat_ms {
            figment = figment.merge(("nucleus.heartbeat_ms", v));
        }
        if let Some(v) = overrides.ack_timeout_ms {
            figment = figment.merge(("nucleus.ack_timeout_ms", v));
        }
        if let Some(v) = &overrides.host {
            figment = figment.merge(("server.host", v));
        }
        if let Some(v) = overrides.port {
            figment = figment.merge(("server.port", v));
        }
        if let Some(v) = &overrides.cellets {
            figment = figment.merge(("server.cellets", v));
        }

        let config: CliAppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/cellet/config.toml`, if the platform has a config dir
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cellet").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.nucleus
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.server.host.is_empty() {
            return Err(ConfigError::Validation("server host must not be empty".to_string()));
        }
        if let Some(name) = self.server.cellets.iter().find(|name| name.is_empty()) {
            return Err(ConfigError::Validation(format!(
                "empty cellet name in server cellets: {name:?}"
            )));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
