//! Worker configuration
//!
//! Loaded from an optional `garrison.toml` file overlaid with
//! `GARRISON__`-prefixed environment variables
//! (e.g. `GARRISON__DATABASE__URL`).

use serde::Deserialize;

/// Top-level worker settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,

    #[serde(default)]
    pub rcon: RconSettings,
}

/// Definition-store connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// RCON connector settings
#[derive(Debug, Clone, Deserialize)]
pub struct RconSettings {
    /// Log commands instead of sending them to a live server
    #[serde(default = "default_true")]
    pub dry_run: bool,
}

impl Default for RconSettings {
    fn default() -> Self {
        Self { dry_run: true }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from file and environment
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("garrison").required(false))
            .add_source(config::Environment::with_prefix("GARRISON").separator("__"))
            .build()?
            .try_deserialize()
    }
}
