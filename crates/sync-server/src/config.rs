//! Configuration loading and management

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for the sync server
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Token configuration
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Change feed and object limits
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Access token lifetime in seconds (default: 1 hour)
    #[serde(default = "default_access_token_lifetime")]
    pub access_token_lifetime_secs: u64,

    /// Refresh token lifetime in seconds (default: 30 days)
    #[serde(default = "default_refresh_token_lifetime")]
    pub refresh_token_lifetime_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_token_lifetime_secs: default_access_token_lifetime(),
            refresh_token_lifetime_secs: default_refresh_token_lifetime(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum changes returned per feed page (default: 100)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Maximum accepted object body in bytes (default: 8 MiB)
    #[serde(default = "default_max_object_bytes")]
    pub max_object_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_object_bytes: default_max_object_bytes(),
        }
    }
}

fn default_access_token_lifetime() -> u64 {
    3600 // 1 hour
}

fn default_refresh_token_lifetime() -> u64 {
    30 * 24 * 3600 // 30 days
}

fn default_page_size() -> usize {
    100
}

fn default_max_object_bytes() -> usize {
    8 * 1024 * 1024
}

impl Config {
    /// Load configuration from the data directory
    pub fn load(data_path: &str) -> Result<Self> {
        let config_file = Path::new(data_path).join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| "Failed to parse config.json")?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            // Create data directory if it doesn't exist
            std::fs::create_dir_all(data_path)
                .with_context(|| format!("Failed to create data directory: {}", data_path))?;

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }
}
