//! Common error types

use thiserror::Error;

/// Configuration and file loading errors shared by the engine and the agent.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration error: missing required field `{field}` for {config_id}")]
    MissingField {
        config_id: String,
        field: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
