//! Claims validator
//!
//! Each check is a pure function over decoded claims and returns `true` when
//! the token passes. [`crate::validation::validate_callback`] composes them in
//! a fixed, fail-fast order and maps the first failure to a
//! [`ValidationResult`].

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::{debug, warn};

use crate::constants::REFRESH_TOKEN_NONCE_SENTINEL;

/// Outcome of validating one authorization response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationResult {
    NotSet,
    Ok,
    StatesDoNotMatch,
    SignatureFailed,
    IncorrectNonce,
    RequiredPropertyMissing,
    MaxOffsetExpired,
    IssDoesNotMatchIssuer,
    NoAuthWellKnownEndPoints,
    IncorrectAud,
    IncorrectAzp,
    IncorrectIdTokenClaimsAfterRefresh,
    TokenExpired,
    IncorrectAtHash,
    LoginRequired,
    SecureTokenServerError,
}

impl ValidationResult {
    /// Stable snake_case name used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ValidationResult::NotSet => "not_set",
            ValidationResult::Ok => "ok",
            ValidationResult::StatesDoNotMatch => "states_do_not_match",
            ValidationResult::SignatureFailed => "signature_failed",
            ValidationResult::IncorrectNonce => "incorrect_nonce",
            ValidationResult::RequiredPropertyMissing => "required_property_missing",
            ValidationResult::MaxOffsetExpired => "max_offset_expired",
            ValidationResult::IssDoesNotMatchIssuer => "iss_does_not_match_issuer",
            ValidationResult::NoAuthWellKnownEndPoints => "no_auth_well_known_endpoints",
            ValidationResult::IncorrectAud => "incorrect_aud",
            ValidationResult::IncorrectAzp => "incorrect_azp",
            ValidationResult::IncorrectIdTokenClaimsAfterRefresh => {
                "incorrect_id_token_claims_after_refresh"
            }
            ValidationResult::TokenExpired => "token_expired",
            ValidationResult::IncorrectAtHash => "incorrect_at_hash",
            ValidationResult::LoginRequired => "login_required",
            ValidationResult::SecureTokenServerError => "secure_token_server_error",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ValidationResult::Ok)
    }
}

impl std::fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

const REQUIRED_CLAIMS: [&str; 5] = ["iss", "sub", "aud", "exp", "iat"];

/// Numeric date claim; JSON numbers may arrive as floats.
pub fn numeric_claim(claims: &Value, name: &str) -> Option<i64> {
    let value = claims.get(name)?;
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

fn string_claim<'a>(claims: &'a Value, name: &str) -> Option<&'a str> {
    claims.get(name).and_then(Value::as_str)
}

/// Returned `state` must equal the stored state control. An empty stored
/// value never matches.
pub fn validate_state(returned: Option<&str>, expected: Option<&str>) -> bool {
    match (returned, expected) {
        (Some(returned), Some(expected)) if !expected.is_empty() => returned == expected,
        _ => false,
    }
}

/// Token nonce must equal the stored nonce.
///
/// While a refresh grant is validated the stored nonce is the refresh
/// sentinel: a token without a nonce passes, and with
/// `ignore_nonce_after_refresh` any nonce passes.
pub fn validate_nonce(
    claims: &Value,
    expected: Option<&str>,
    ignore_nonce_after_refresh: bool,
) -> bool {
    let token_nonce = string_claim(claims, "nonce");

    if expected == Some(REFRESH_TOKEN_NONCE_SENTINEL) {
        if token_nonce.is_none() {
            return true;
        }
        if ignore_nonce_after_refresh {
            warn!("ignore_nonce_after_refresh set, accepting refreshed id token nonce unchecked");
            return true;
        }
    }

    match (token_nonce, expected) {
        (Some(token_nonce), Some(expected)) if token_nonce == expected => true,
        (token_nonce, expected) => {
            debug!(?token_nonce, ?expected, "nonce mismatch");
            false
        }
    }
}

/// `iss`, `sub`, `aud`, `exp` and `iat` must all be present.
pub fn validate_required_claims(claims: &Value) -> bool {
    let missing: Vec<&str> = REQUIRED_CLAIMS
        .iter()
        .copied()
        .filter(|name| claims.get(name).is_none_or(Value::is_null))
        .collect();
    if !missing.is_empty() {
        debug!(?missing, "id token is missing required claims");
    }
    missing.is_empty()
}

/// `|now - iat|` must stay below `max_offset_secs`.
pub fn validate_iat_offset(claims: &Value, max_offset_secs: u64, disabled: bool, now: i64) -> bool {
    if disabled {
        warn!("iat offset validation disabled, skipping check");
        return true;
    }
    let Some(iat) = numeric_claim(claims, "iat") else {
        return false;
    };
    let offset = now.abs_diff(iat);
    if offset >= max_offset_secs {
        debug!(iat, now, offset, max_offset_secs, "id token issued outside allowed offset");
        return false;
    }
    true
}

/// `iss` must equal the well-known issuer exactly.
pub fn validate_issuer(claims: &Value, issuer: &str) -> bool {
    let iss = string_claim(claims, "iss");
    if iss != Some(issuer) {
        debug!(?iss, issuer, "issuer mismatch");
        return false;
    }
    true
}

fn audiences(claims: &Value) -> Vec<&str> {
    match claims.get("aud") {
        Some(Value::String(aud)) => vec![aud.as_str()],
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// `aud` (string or array) must contain the client id.
pub fn validate_audience(claims: &Value, client_id: &str) -> bool {
    audiences(claims).contains(&client_id)
}

/// A token issued for several audiences must name its authorized party.
pub fn validate_azp_exists_if_multiple_audiences(claims: &Value) -> bool {
    audiences(claims).len() <= 1 || string_claim(claims, "azp").is_some()
}

/// When `azp` is present it must be the client id.
pub fn validate_azp_if_present(claims: &Value, client_id: &str) -> bool {
    string_claim(claims, "azp").is_none_or(|azp| azp == client_id)
}

/// A refreshed id token must describe the same authentication event as the
/// one it replaces: same `iss`, `sub`, `aud`, `azp` and `auth_time`, and an
/// `iat` that is not older.
pub fn validate_claims_after_refresh(new: &Value, existing: &Value) -> bool {
    for name in ["iss", "sub", "azp"] {
        if new.get(name) != existing.get(name) {
            debug!(claim = name, "claim changed across refresh");
            return false;
        }
    }

    let mut new_aud = audiences(new);
    let mut existing_aud = audiences(existing);
    new_aud.sort_unstable();
    existing_aud.sort_unstable();
    if new_aud != existing_aud {
        debug!("aud changed across refresh");
        return false;
    }

    if existing.get("auth_time").is_some()
        && numeric_claim(new, "auth_time") != numeric_claim(existing, "auth_time")
    {
        debug!("auth_time changed across refresh");
        return false;
    }

    match (numeric_claim(new, "iat"), numeric_claim(existing, "iat")) {
        (Some(new_iat), Some(existing_iat)) if new_iat < existing_iat => {
            debug!(new_iat, existing_iat, "refreshed id token is older than the existing one");
            false
        }
        _ => true,
    }
}

/// `now` must be before `exp + clock_skew_secs`.
pub fn validate_not_expired(claims: &Value, clock_skew_secs: u64, now: i64) -> bool {
    let Some(exp) = numeric_claim(claims, "exp") else {
        return false;
    };
    let deadline = exp.saturating_add_unsigned(clock_skew_secs);
    if now >= deadline {
        debug!(exp, now, clock_skew_secs, "id token expired");
        return false;
    }
    true
}

/// `base64url(left half of hash(access_token))`, hash chosen by the `alg`
/// suffix (`…384`, `…512`, otherwise SHA-256).
pub fn generate_at_hash(access_token: &str, alg: &str) -> String {
    let digest: Vec<u8> = if alg.ends_with("384") {
        Sha384::digest(access_token.as_bytes()).to_vec()
    } else if alg.ends_with("512") {
        Sha512::digest(access_token.as_bytes()).to_vec()
    } else {
        Sha256::digest(access_token.as_bytes()).to_vec()
    };
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

/// `at_hash` must match the access token, either as received or percent-decoded.
pub fn validate_at_hash(access_token: &str, at_hash: &str, alg: &str) -> bool {
    if generate_at_hash(access_token, alg) == at_hash {
        return true;
    }
    match urlencoding::decode(access_token) {
        Ok(decoded) if decoded != access_token => generate_at_hash(&decoded, alg) == at_hash,
        _ => false,
    }
}
