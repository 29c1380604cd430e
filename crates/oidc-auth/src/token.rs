//! Token endpoint interactions
//!
//! Code exchange, refresh-token grant, revocation and userinfo, all through
//! the [`Transport`] collaborator. Responses are returned raw; trust decisions
//! belong to the validation pipeline.
//!
//! Connectivity failures surface as `Error::Transport(TransportError::Network)`
//! and OP error bodies as `Error::Transport(TransportError::Status)`, so the
//! caller can keep existing tokens on the former.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::callback::AuthResult;
use crate::config::OidcConfig;
use crate::constants::REFRESH_RETRY_DELAY_SECS;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::urls;

fn parse_token_response(value: Value, endpoint: &str) -> Result<AuthResult> {
    serde_json::from_value(value)
        .map_err(|e| Error::TokenExchange(format!("invalid response from {endpoint}: {e}")))
}

/// Exchange an authorization code (plus PKCE verifier) for tokens.
///
/// `redirect_uri` must be the one the authorization request used: the
/// silent-renew URL for iframe renewals, otherwise the redirect URL.
pub async fn exchange_code(
    transport: &dyn Transport,
    token_endpoint: &str,
    config: &OidcConfig,
    code: &str,
    code_verifier: Option<&str>,
    redirect_uri: &str,
) -> Result<AuthResult> {
    let body = urls::code_request_body(
        &config.client_id,
        code,
        code_verifier,
        redirect_uri,
        &config.custom_params_code_request,
    );
    let response = transport.post_form(token_endpoint, &body).await?;
    debug!(config_id = %config.config_id, "authorization code exchanged");
    parse_token_response(response, token_endpoint)
}

/// Refresh-token grant. A network failure is retried once after a short delay;
/// OP error responses are not retried.
pub async fn refresh_tokens(
    transport: &dyn Transport,
    token_endpoint: &str,
    config: &OidcConfig,
    refresh_token: &str,
    custom_params: &[(String, String)],
) -> Result<AuthResult> {
    let mut params = config.custom_params_refresh_token_request.clone();
    params.extend(custom_params.iter().cloned());
    let body = urls::refresh_request_body(&config.client_id, refresh_token, &params);

    let response = match transport.post_form(token_endpoint, &body).await {
        Ok(response) => response,
        Err(e) => {
            let err = Error::from(e);
            if !err.is_network() {
                return Err(err);
            }
            warn!(
                config_id = %config.config_id,
                error = %err,
                retry_in_secs = REFRESH_RETRY_DELAY_SECS,
                "refresh request failed, retrying once"
            );
            tokio::time::sleep(Duration::from_secs(REFRESH_RETRY_DELAY_SECS)).await;
            transport.post_form(token_endpoint, &body).await?
        }
    };

    info!(config_id = %config.config_id, "tokens refreshed");
    parse_token_response(response, token_endpoint)
}

/// RFC 7009 revocation of one token.
pub async fn revoke_token(
    transport: &dyn Transport,
    revocation_endpoint: &str,
    client_id: &str,
    token: &str,
    token_type_hint: &str,
) -> Result<()> {
    let body = urls::revocation_request_body(client_id, token, token_type_hint);
    transport.post_form(revocation_endpoint, &body).await?;
    debug!(token_type_hint, "token revoked");
    Ok(())
}

/// Claims from the userinfo endpoint.
pub async fn fetch_user_info(
    transport: &dyn Transport,
    userinfo_endpoint: &str,
    access_token: &str,
) -> Result<Value> {
    let value = transport.get_json(userinfo_endpoint, Some(access_token)).await?;
    if !value.is_object() {
        return Err(Error::TokenExchange(format!(
            "userinfo endpoint {userinfo_endpoint} returned a non-object"
        )));
    }
    Ok(value)
}

/// `error` and `error_description` from an OP error body, if it has one.
pub fn op_error_from_body(body: &str) -> Option<(String, Option<String>)> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?.as_str()?.to_owned();
    let description = value
        .get("error_description")
        .and_then(Value::as_str)
        .map(str::to_owned);
    Some((error, description))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedTransport, form_value};
    use crate::transport::TransportError;
    use serde_json::json;

    const TOKEN_ENDPOINT: &str = "https://op.example.com/token";

    fn config() -> OidcConfig {
        let mut config = OidcConfig::new("https://op.example.com", "spa", "https://app.example.com/cb");
        config.custom_params_code_request = vec![("resource".into(), "api".into())];
        config
    }

    #[tokio::test]
    async fn exchange_posts_code_and_verifier() {
        let transport = ScriptedTransport::new(vec![Ok(json!({
            "access_token": "at",
            "id_token": "a.b.c",
            "refresh_token": "rt",
            "expires_in": 300
        }))]);

        let result = exchange_code(&transport, TOKEN_ENDPOINT, &config(), "code-1", Some("verifier-1"), "https://app.example.com/cb")
            .await
            .unwrap();
        assert_eq!(result.access_token(), Some("at"));
        assert_eq!(result.refresh_token(), Some("rt"));

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, TOKEN_ENDPOINT);
        assert_eq!(form_value(&calls[0], "grant_type"), Some("authorization_code"));
        assert_eq!(form_value(&calls[0], "code_verifier"), Some("verifier-1"));
        assert_eq!(form_value(&calls[0], "resource"), Some("api"));
    }

    #[tokio::test]
    async fn op_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Status {
            status: 400,
            body: r#"{"error":"invalid_grant"}"#.into(),
        })]);
        let err = refresh_tokens(&transport, TOKEN_ENDPOINT, &config(), "rt", &[])
            .await
            .unwrap_err();
        assert!(!err.is_network());
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn network_error_is_retried_once() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Network("connection reset".into())),
            Ok(json!({"access_token": "at-2"})),
        ]);
        let started = tokio::time::Instant::now();
        let result = refresh_tokens(&transport, TOKEN_ENDPOINT, &config(), "rt", &[])
            .await
            .unwrap();
        assert_eq!(result.access_token(), Some("at-2"));
        assert_eq!(transport.calls().len(), 2);
        assert!(started.elapsed() >= Duration::from_secs(REFRESH_RETRY_DELAY_SECS));
    }

    #[tokio::test(start_paused = true)]
    async fn second_network_error_is_returned() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Network("down".into())),
            Err(TransportError::Network("still down".into())),
        ]);
        let err = refresh_tokens(&transport, TOKEN_ENDPOINT, &config(), "rt", &[])
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn refresh_merges_custom_params() {
        let transport = ScriptedTransport::new(vec![Ok(json!({"access_token": "at"}))]);
        let mut config = config();
        config.custom_params_refresh_token_request = vec![("a".into(), "1".into())];
        refresh_tokens(&transport, TOKEN_ENDPOINT, &config, "rt", &[("b".into(), "2".into())])
            .await
            .unwrap();
        let call = &transport.calls()[0];
        assert_eq!(form_value(call, "refresh_token"), Some("rt"));
        assert_eq!(form_value(call, "a"), Some("1"));
        assert_eq!(form_value(call, "b"), Some("2"));
    }

    #[tokio::test]
    async fn revoke_sends_type_hint() {
        let transport = ScriptedTransport::new(vec![Ok(Value::Null)]);
        revoke_token(&transport, "https://op.example.com/revoke", "spa", "rt", "refresh_token")
            .await
            .unwrap();
        let call = &transport.calls()[0];
        assert_eq!(form_value(call, "token_type_hint"), Some("refresh_token"));
        assert_eq!(form_value(call, "client_id"), Some("spa"));
    }

    #[tokio::test]
    async fn userinfo_uses_bearer_token() {
        let transport = ScriptedTransport::new(vec![Ok(json!({"sub": "alice"}))]);
        let info = fetch_user_info(&transport, "https://op.example.com/userinfo", "at")
            .await
            .unwrap();
        assert_eq!(info["sub"], "alice");
        assert_eq!(transport.calls()[0].bearer.as_deref(), Some("at"));
    }

    #[test]
    fn op_error_body_is_parsed() {
        let (error, description) =
            op_error_from_body(r#"{"error":"invalid_grant","error_description":"expired"}"#).unwrap();
        assert_eq!(error, "invalid_grant");
        assert_eq!(description.as_deref(), Some("expired"));
        assert!(op_error_from_body("<html>").is_none());
    }
}
