//! HTTP mapping of engine errors
//!
//! Validation failures never reach this type: they are `AuthOutcome` values
//! rendered by the callback handler. Only operational failures do.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Route handler error.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub oidc_session::Error);

impl From<oidc_auth::Error> for ApiError {
    fn from(err: oidc_auth::Error) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use oidc_auth::Error as AuthError;
        use oidc_session::Error;

        match &self.0 {
            Error::UnknownConfig(_) => StatusCode::NOT_FOUND,
            Error::RenewAlreadyRunning(_) => StatusCode::CONFLICT,
            Error::RenewTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Auth(AuthError::NoRefreshToken) => StatusCode::UNAUTHORIZED,
            Error::Auth(AuthError::InvalidCallback(_)) => StatusCode::BAD_REQUEST,
            Error::Auth(
                AuthError::Transport(_) | AuthError::TokenExchange(_) | AuthError::Metadata(_),
            ) => StatusCode::BAD_GATEWAY,
            Error::NoSilentRenewFrame(_) | Error::MissingCheckSessionEndpoint(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "request failed");
        } else {
            tracing::warn!(status = status.as_u16(), error = %self.0, "request rejected");
        }
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": self.0.to_string() }).to_string(),
        )
            .into_response()
    }
}

/// Result alias for route handlers.
pub type Result<T> = std::result::Result<T, ApiError>;
