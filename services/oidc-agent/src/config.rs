//! Agent configuration loading
//!
//! Path precedence: `--config` > `CONFIG_PATH` env > `oidc-agent.toml`.
//! `OIDC_AGENT_STORAGE_PATH` overrides the flow-state file named in the TOML.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use oidc_auth::OidcConfig;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub clients: Vec<OidcConfig>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Timeout for every request the agent makes to an OP.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

/// Flow-state persistence
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_max_connections() -> usize {
    64
}

fn default_http_timeout() -> u64 {
    10
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("oidc-agent-state.json")
}

impl AgentConfig {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;

        if let Ok(storage_path) = std::env::var("OIDC_AGENT_STORAGE_PATH") {
            config.storage.path = PathBuf::from(storage_path);
        }

        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn parse(contents: &str) -> common::Result<Self> {
        let config: AgentConfig = toml::from_str(contents)?;

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if config.server.http_timeout_secs == 0 {
            return Err(common::Error::Config(
                "http_timeout_secs must be greater than 0".into(),
            ));
        }
        if config.clients.is_empty() {
            return Err(common::Error::Config(
                "at least one [[clients]] entry is required".into(),
            ));
        }

        let clients = config
            .clients
            .into_iter()
            .map(OidcConfig::validate)
            .collect::<common::Result<Vec<_>>>()?;

        let mut seen = HashSet::new();
        for client in &clients {
            if !seen.insert(client.config_id.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate config_id: {}",
                    client.config_id
                )));
            }
        }

        Ok(Self {
            clients,
            ..config
        })
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("oidc-agent.toml")
    }
}
