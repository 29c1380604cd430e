//! HTTP transport collaborator
//!
//! The engine talks to OP endpoints (discovery, JWKS, token, userinfo,
//! revocation) only through [`Transport`]. Connectivity failures and OP error
//! responses are distinct variants: the former are transient and must not
//! clear a valid session, the latter are protocol verdicts.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tracing::debug;

/// Boxed future used by the collaborator traits so they stay dyn-compatible.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failure talking to an OP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No HTTP response at all (DNS, refused connection, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// The OP answered with a non-success status.
    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The OP answered successfully but the body was not JSON.
    #[error("invalid response body: {0}")]
    Decode(String),
}

/// GET/POST against OP endpoints, returning parsed JSON.
///
/// An empty success body (e.g. revocation) is returned as `Value::Null`.
pub trait Transport: Send + Sync {
    /// GET `url`, optionally with a bearer token.
    fn get_json<'a>(
        &'a self,
        url: &'a str,
        bearer: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Value, TransportError>>;

    /// POST `form` as `application/x-www-form-urlencoded` to `url`.
    fn post_form<'a>(
        &'a self,
        url: &'a str,
        form: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<Value, TransportError>>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn get_json<'a>(
        &'a self,
        url: &'a str,
        bearer: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Value, TransportError>> {
        Box::pin(async move {
            let mut request = self.client.get(url);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| TransportError::Network(format!("GET {url} failed: {e}")))?;
            read_json(response).await
        })
    }

    fn post_form<'a>(
        &'a self,
        url: &'a str,
        form: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<Value, TransportError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(url)
                .form(form)
                .send()
                .await
                .map_err(|e| TransportError::Network(format!("POST {url} failed: {e}")))?;
            read_json(response).await
        })
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, TransportError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| TransportError::Network(format!("reading response body: {e}")))?;

    if !status.is_success() {
        return Err(TransportError::Status {
            status: status.as_u16(),
            body,
        });
    }

    if body.trim().is_empty() {
        debug!(status = status.as_u16(), "empty response body");
        return Ok(Value::Null);
    }

    serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let transport = ReqwestTransport::default();
        let err = transport
            .get_json("http://127.0.0.1:9/.well-known/openid-configuration", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_)), "got: {err:?}");
    }

    #[test]
    fn status_error_display_includes_body() {
        let err = TransportError::Status {
            status: 400,
            body: r#"{"error":"invalid_grant"}"#.into(),
        };
        assert!(err.to_string().contains("invalid_grant"));
    }
}
