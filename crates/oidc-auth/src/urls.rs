//! Authorization, end-session and token-endpoint request construction
//!
//! Query values are form-urlencoded by `url`. Protocol parameters come first,
//! caller-supplied custom parameters are appended last in insertion order, and
//! an endpoint's existing query string is kept.

use url::Url;

use crate::constants::CODE_CHALLENGE_METHOD;
use crate::error::{Error, Result};

/// Inputs for an authorization request URL.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeParams<'a> {
    pub authorization_endpoint: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub response_type: &'a str,
    pub scope: &'a str,
    /// Omitted when empty.
    pub nonce: &'a str,
    pub state: &'a str,
    /// PKCE S256 challenge; adds `code_challenge` + `code_challenge_method`.
    pub code_challenge: Option<&'a str>,
    /// `prompt` value, e.g. `none` for silent renewal.
    pub prompt: Option<&'a str>,
    pub custom: &'a [(String, String)],
}

/// `{authorization_endpoint}?client_id=..&redirect_uri=..&response_type=..&scope=..&nonce=..&state=..[&code_challenge=..&code_challenge_method=S256][&prompt=..][&custom..]`
pub fn build_authorize_url(params: &AuthorizeParams<'_>) -> Result<String> {
    let mut url = parse_endpoint(params.authorization_endpoint, "authorization_endpoint")?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", params.client_id)
            .append_pair("redirect_uri", params.redirect_uri)
            .append_pair("response_type", params.response_type)
            .append_pair("scope", params.scope);
        if !params.nonce.is_empty() {
            query.append_pair("nonce", params.nonce);
        }
        query.append_pair("state", params.state);
        if let Some(challenge) = params.code_challenge {
            query
                .append_pair("code_challenge", challenge)
                .append_pair("code_challenge_method", CODE_CHALLENGE_METHOD);
        }
        if let Some(prompt) = params.prompt {
            query.append_pair("prompt", prompt);
        }
        for (key, value) in params.custom {
            query.append_pair(key, value);
        }
    }
    Ok(url.into())
}

/// End-session URL on top of the OP's endpoint (which may carry its own query,
/// e.g. a B2C policy selector).
pub fn build_end_session_url(
    end_session_endpoint: &str,
    id_token_hint: Option<&str>,
    post_logout_redirect_uri: Option<&str>,
    custom: &[(String, String)],
) -> Result<String> {
    let mut url = parse_endpoint(end_session_endpoint, "end_session_endpoint")?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(hint) = id_token_hint {
            query.append_pair("id_token_hint", hint);
        }
        if let Some(redirect) = post_logout_redirect_uri {
            query.append_pair("post_logout_redirect_uri", redirect);
        }
        for (key, value) in custom {
            query.append_pair(key, value);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url.into())
}

/// Form body for the authorization-code grant.
pub fn code_request_body(
    client_id: &str,
    code: &str,
    code_verifier: Option<&str>,
    redirect_uri: &str,
    custom: &[(String, String)],
) -> Vec<(String, String)> {
    let mut body = vec![
        pair("grant_type", "authorization_code"),
        pair("client_id", client_id),
    ];
    if let Some(verifier) = code_verifier {
        body.push(pair("code_verifier", verifier));
    }
    body.push(pair("code", code));
    body.push(pair("redirect_uri", redirect_uri));
    body.extend(custom.iter().cloned());
    body
}

/// Form body for the refresh-token grant.
pub fn refresh_request_body(
    client_id: &str,
    refresh_token: &str,
    custom: &[(String, String)],
) -> Vec<(String, String)> {
    let mut body = vec![
        pair("grant_type", "refresh_token"),
        pair("client_id", client_id),
        pair("refresh_token", refresh_token),
    ];
    body.extend(custom.iter().cloned());
    body
}

/// Form body for RFC 7009 token revocation.
pub fn revocation_request_body(
    client_id: &str,
    token: &str,
    token_type_hint: &str,
) -> Vec<(String, String)> {
    vec![
        pair("client_id", client_id),
        pair("token", token),
        pair("token_type_hint", token_type_hint),
    ]
}

fn parse_endpoint(endpoint: &str, name: &str) -> Result<Url> {
    Url::parse(endpoint).map_err(|e| Error::Config(format!("invalid {name} {endpoint:?}: {e}")))
}

fn pair(key: &str, value: &str) -> (String, String) {
    (key.to_owned(), value.to_owned())
}
