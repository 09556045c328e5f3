//! Fleet connection configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::fleet::maas::Credentials;

/// Default MAAS API version.
pub const DEFAULT_API_VERSION: &str = "1.0";

/// Default timeout for fleet API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default durable storage directory.
const DEFAULT_STORAGE_DIR: &str = "~/.metal-fleet/storage";

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_storage_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    PathBuf::from(DEFAULT_STORAGE_DIR.replace('~', &home))
}

/// Configuration for talking to a fleet and persisting cluster state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Fleet server URL (e.g., `http://maas.example.com/MAAS`).
    pub server_url: String,
    /// API key in `consumer_key:token_key:token_secret` form.
    pub api_key: String,
    /// API version path segment.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Tag attached to every node this orchestrator acquires.
    pub agent_name: String,
    /// Root directory of durable storage.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl FleetConfig {
    /// Create a configuration with default version, storage and timeout.
    #[must_use]
    pub fn new(
        server_url: impl Into<String>,
        api_key: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            api_version: default_api_version(),
            agent_name: agent_name.into(),
            storage_dir: default_storage_dir(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Reads `MAAS_SERVER`, `MAAS_API_KEY` and `FLEET_AGENT_NAME`, plus the
    /// optional `MAAS_API_VERSION`, `FLEET_STORAGE_DIR` and
    /// `FLEET_TIMEOUT_SECS`.
    ///
    /// # Errors
    /// Returns an error if a required variable is missing or invalid.
    pub fn from_env() -> Result<Self> {
        let server_url =
            std::env::var("MAAS_SERVER").map_err(|_| anyhow::anyhow!("MAAS_SERVER not set"))?;
        let api_key =
            std::env::var("MAAS_API_KEY").map_err(|_| anyhow::anyhow!("MAAS_API_KEY not set"))?;
        let agent_name = std::env::var("FLEET_AGENT_NAME")
            .map_err(|_| anyhow::anyhow!("FLEET_AGENT_NAME not set"))?;

        let mut config = Self::new(server_url, api_key, agent_name);
        if let Ok(version) = std::env::var("MAAS_API_VERSION") {
            config.api_version = version;
        }
        if let Ok(dir) = std::env::var("FLEET_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Ok(timeout) = std::env::var("FLEET_TIMEOUT_SECS") {
            config.timeout_secs = timeout
                .parse()
                .context("FLEET_TIMEOUT_SECS must be a number of seconds")?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    ///
    /// # Errors
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.server_url)
            .with_context(|| format!("Invalid server URL: {}", self.server_url))?;
        if Credentials::parse(&self.api_key).is_none() {
            anyhow::bail!("API key must have the form consumer_key:token_key:token_secret");
        }
        if self.agent_name.trim().is_empty() {
            anyhow::bail!("agent name must not be empty");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("timeout must be at least one second");
        }
        Ok(())
    }
}
