//! Validation pipeline for one authorization response
//!
//! Runs the claims checks in their fixed order and stops at the first
//! failure. The pipeline has no side effects besides logging: clearing the
//! nonce/state and persisting tokens is the caller's job, driven by
//! [`StateValidationResult::auth_response_is_valid`].

use jsonwebtoken::jwk::JwkSet;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::claims::{self, ValidationResult};
use crate::config::{FlowKind, OidcConfig};
use crate::jwt;
use crate::signature;
use crate::well_known::WellKnownEndpoints;

/// Everything the pipeline reads for one callback or refresh.
#[derive(Debug, Clone, Copy)]
pub struct ValidationInput<'a> {
    pub config: &'a OidcConfig,
    pub flow: FlowKind,
    pub returned_state: Option<&'a str>,
    pub expected_state: Option<&'a str>,
    pub expected_nonce: Option<&'a str>,
    pub access_token: Option<&'a str>,
    pub id_token: Option<&'a str>,
    /// Id token currently held; only consulted for refresh grants.
    pub existing_id_token: Option<&'a str>,
    pub well_known: Option<&'a WellKnownEndpoints>,
    pub jwks: &'a JwkSet,
    /// Seconds since the Unix epoch.
    pub now: i64,
}

/// Verdict on an authorization response.
#[derive(Debug, Clone, PartialEq)]
pub struct StateValidationResult {
    pub state: ValidationResult,
    pub access_token: Option<String>,
    pub id_token: Option<String>,
    pub decoded_id_token: Value,
    pub auth_response_is_valid: bool,
}

impl StateValidationResult {
    fn failed(state: ValidationResult) -> Self {
        warn!(result = state.label(), "authorization response rejected");
        Self {
            state,
            access_token: None,
            id_token: None,
            decoded_id_token: Value::Object(Default::default()),
            auth_response_is_valid: false,
        }
    }

    fn valid(input: &ValidationInput<'_>, decoded_id_token: Value) -> Self {
        debug!(flow = input.flow.label(), "authorization response validated");
        Self {
            state: ValidationResult::Ok,
            access_token: input.access_token.map(str::to_owned),
            id_token: input.id_token.map(str::to_owned),
            decoded_id_token,
            auth_response_is_valid: true,
        }
    }
}

/// Validate an authorization response, fail-fast.
pub fn validate_callback(input: &ValidationInput<'_>) -> StateValidationResult {
    if !claims::validate_state(input.returned_state, input.expected_state) {
        return StateValidationResult::failed(ValidationResult::StatesDoNotMatch);
    }

    let config = input.config;
    let id_token = input.id_token.filter(|token| !token.is_empty());

    let Some(id_token) = id_token else {
        // A refresh grant may legitimately return only an access token.
        if input.flow == FlowKind::Refresh {
            return StateValidationResult::valid(input, Value::Object(Default::default()));
        }
        return StateValidationResult::failed(ValidationResult::RequiredPropertyMissing);
    };

    let decoded = jwt::get_payload(Some(id_token), false);

    if !signature::validate_signature(id_token, input.jwks) {
        return StateValidationResult::failed(ValidationResult::SignatureFailed);
    }

    if !claims::validate_nonce(&decoded, input.expected_nonce, config.ignore_nonce_after_refresh) {
        return StateValidationResult::failed(ValidationResult::IncorrectNonce);
    }

    if !claims::validate_required_claims(&decoded) {
        return StateValidationResult::failed(ValidationResult::RequiredPropertyMissing);
    }

    if !claims::validate_iat_offset(
        &decoded,
        config.max_id_token_iat_offset_secs,
        config.disable_iat_offset_validation,
        input.now,
    ) {
        return StateValidationResult::failed(ValidationResult::MaxOffsetExpired);
    }

    let Some(well_known) = input.well_known else {
        error!(config_id = %config.config_id, "no well-known endpoints available for issuer check");
        return StateValidationResult::failed(ValidationResult::NoAuthWellKnownEndPoints);
    };
    if config.iss_validation_off {
        warn!(config_id = %config.config_id, "iss_validation_off set, skipping issuer check");
    } else if !claims::validate_issuer(&decoded, &well_known.issuer) {
        return StateValidationResult::failed(ValidationResult::IssDoesNotMatchIssuer);
    }

    if !claims::validate_audience(&decoded, &config.client_id) {
        return StateValidationResult::failed(ValidationResult::IncorrectAud);
    }

    if !claims::validate_azp_exists_if_multiple_audiences(&decoded)
        || !claims::validate_azp_if_present(&decoded, &config.client_id)
    {
        return StateValidationResult::failed(ValidationResult::IncorrectAzp);
    }

    if input.flow == FlowKind::Refresh
        && let Some(existing) = input.existing_id_token.filter(|t| !t.is_empty())
    {
        let existing = jwt::get_payload(Some(existing), false);
        if !jwt::is_empty_claims(&existing) && !claims::validate_claims_after_refresh(&decoded, &existing) {
            return StateValidationResult::failed(ValidationResult::IncorrectIdTokenClaimsAfterRefresh);
        }
    }

    if !claims::validate_not_expired(&decoded, config.clock_skew_secs, input.now) {
        return StateValidationResult::failed(ValidationResult::TokenExpired);
    }

    let response_type = config.response_type;
    if !response_type.is_code_flow() && !response_type.is_implicit_with_access_token() {
        return StateValidationResult::valid(input, decoded);
    }

    match decoded.get("at_hash").and_then(Value::as_str) {
        None if response_type.is_code_flow() => {
            debug!("code flow without at_hash, skipping access token hash check");
        }
        at_hash => {
            let alg = jwt::get_header(Some(id_token), false)
                .get("alg")
                .and_then(Value::as_str)
                .unwrap_or("RS256")
                .to_owned();
            let matches = match (input.access_token, at_hash) {
                (Some(access_token), Some(at_hash)) => claims::validate_at_hash(access_token, at_hash, &alg),
                _ => false,
            };
            if !matches {
                return StateValidationResult::failed(ValidationResult::IncorrectAtHash);
            }
        }
    }

    StateValidationResult::valid(input, decoded)
}
