//! Error types for OIDC protocol operations
//!
//! Protocol validation failures are not errors: they are reported as
//! [`crate::ValidationResult`] values. These variants cover transport,
//! storage, configuration and usage failures.

use crate::transport::TransportError;

/// Errors from OIDC protocol operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid callback: {0}")]
    InvalidCallback(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("metadata unavailable: {0}")]
    Metadata(String),

    #[error("no refresh token found, please login")]
    NoRefreshToken,
}

impl Error {
    /// Whether this failure is a connectivity problem rather than an OP verdict.
    ///
    /// Network failures leave existing tokens in place.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Transport(TransportError::Network(_)))
    }
}

impl From<common::Error> for Error {
    fn from(err: common::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result alias for OIDC protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
