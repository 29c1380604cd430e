//! Authorization callback parsing
//!
//! The OP redirects back with parameters in the query (code flow) or the
//! fragment (implicit flow). [`parse_callback`] flattens both into one map;
//! [`CallbackContext`] carries what the validation pipeline consumes for one
//! attempt.

use std::collections::HashMap;

use common::Secret;
use jsonwebtoken::jwk::JwkSet;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::config::FlowKind;

/// Parse the query and fragment of a callback URL into a flat map.
///
/// Pairs split on `&`, then on the first `=`; a value containing further
/// `=` keeps them. Values are percent-decoded. Fragment parameters override
/// query parameters of the same name. A bare `#` yields an empty map.
pub fn parse_callback(url: &str) -> HashMap<String, String> {
    let (before_fragment, fragment) = match url.split_once('#') {
        Some((before, fragment)) => (before, Some(fragment)),
        None => (url, None),
    };
    let query = match before_fragment.split_once('?') {
        Some((_, query)) => Some(query),
        // a bare parameter string with no URL around it
        None if !before_fragment.contains("://") && before_fragment.contains('=') => {
            Some(before_fragment)
        }
        None => None,
    };

    let mut params = HashMap::new();
    for part in query.into_iter().chain(fragment) {
        parse_pairs(part, &mut params);
    }
    params
}

fn parse_pairs(input: &str, params: &mut HashMap<String, String>) {
    for pair in input.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(decode(key), decode(value));
    }
}

fn decode(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            debug!(error = %e, "callback value is not valid percent-encoded UTF-8, keeping raw");
            raw.to_owned()
        }
    }
}

/// Tokens and OP parameters from a redirect or a token-endpoint response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthResult {
    #[serde(default)]
    pub access_token: Option<Secret<String>>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    /// Seconds until the access token expires.
    #[serde(default, deserialize_with = "number_or_string")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub session_state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

impl AuthResult {
    /// Build from parsed redirect parameters.
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let get = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            access_token: get("access_token").map(Secret::new),
            id_token: get("id_token"),
            refresh_token: get("refresh_token").map(Secret::new),
            expires_in: get("expires_in").and_then(|v| v.parse().ok()),
            token_type: get("token_type"),
            scope: get("scope"),
            state: get("state"),
            session_state: get("session_state"),
            error: get("error"),
            error_description: get("error_description"),
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_ref().map(Secret::expose_str)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_ref().map(Secret::expose_str)
    }
}

/// One callback or renewal attempt, consumed once by the validation pipeline.
#[derive(Debug, Clone)]
pub struct CallbackContext {
    pub flow: FlowKind,
    pub code: Option<String>,
    pub refresh_token: Option<Secret<String>>,
    pub state: Option<String>,
    pub session_state: Option<String>,
    pub auth_result: AuthResult,
    pub is_renew_process: bool,
    pub jwt_keys: Option<JwkSet>,
    pub existing_id_token: Option<String>,
}

impl CallbackContext {
    /// Context for a redirect callback.
    ///
    /// The code flow reads `code` and leaves tokens to the exchange; the
    /// implicit flow carries the fragment tokens directly.
    pub fn from_redirect(flow: FlowKind, params: &HashMap<String, String>, is_renew_process: bool) -> Self {
        let auth_result = AuthResult::from_params(params);
        Self {
            flow,
            code: params.get("code").filter(|c| !c.is_empty()).cloned(),
            refresh_token: None,
            state: auth_result.state.clone(),
            session_state: auth_result.session_state.clone(),
            auth_result,
            is_renew_process,
            jwt_keys: None,
            existing_id_token: None,
        }
    }

    /// Context for a refresh-token grant.
    pub fn for_refresh(
        refresh_token: Secret<String>,
        state_control: String,
        existing_id_token: Option<String>,
    ) -> Self {
        Self {
            flow: FlowKind::Refresh,
            code: None,
            refresh_token: Some(refresh_token),
            state: Some(state_control),
            session_state: None,
            auth_result: AuthResult::default(),
            is_renew_process: true,
            jwt_keys: None,
            existing_id_token,
        }
    }

    /// OP `error` parameter, if the redirect carried one.
    pub fn op_error(&self) -> Option<&str> {
        self.auth_result.error.as_deref()
    }
}
