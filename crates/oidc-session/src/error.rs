//! Error types for session operations
//!
//! Protocol verdicts are not errors: they travel as
//! [`oidc_auth::ValidationResult`] inside [`crate::AuthOutcome`].

/// Errors from session operations. Clone so a shared renewal result can be
/// handed to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] oidc_auth::Error),

    #[error("silent renew already running for {0}")]
    RenewAlreadyRunning(String),

    #[error("silent renew timed out after {0}s")]
    RenewTimeout(u64),

    #[error("silent renew task aborted: {0}")]
    RenewAborted(String),

    #[error("silent renew frame failed: {0}")]
    SilentRenewFrame(String),

    #[error("no silent renew frame available for {0}")]
    NoSilentRenewFrame(String),

    #[error("OP advertises no check_session_iframe for {0}")]
    MissingCheckSessionEndpoint(String),

    #[error("unknown configuration: {0}")]
    UnknownConfig(String),
}

impl Error {
    /// Whether this failure is a connectivity problem rather than an OP verdict.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Auth(e) if e.is_network())
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use oidc_auth::TransportError;

    #[test]
    fn network_errors_pass_through() {
        let err = Error::from(oidc_auth::Error::Transport(TransportError::Network("down".into())));
        assert!(err.is_network());
        assert!(!Error::RenewTimeout(20).is_network());
    }

    #[test]
    fn missing_refresh_token_message_is_preserved() {
        let err = Error::from(oidc_auth::Error::NoRefreshToken);
        assert_eq!(err.to_string(), "no refresh token found, please login");
    }
}
