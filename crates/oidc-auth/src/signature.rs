//! Id-token signature verification against the OP's key set
//!
//! Key selection is strict: a `kid` in the header must name a key in the set;
//! without a `kid` exactly one signing key of the header's algorithm family
//! may exist. Ambiguity is a configuration error, never a fallback.

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;
use tracing::{debug, error, warn};

/// Key family an algorithm verifies with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ec,
}

impl KeyFamily {
    /// Family for a signature algorithm; `None` for unsupported algorithms.
    pub fn for_algorithm(alg: Algorithm) -> Option<Self> {
        match alg {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => Some(KeyFamily::Rsa),
            Algorithm::ES256 | Algorithm::ES384 => Some(KeyFamily::Ec),
            _ => None,
        }
    }

    fn matches(&self, jwk: &Jwk) -> bool {
        matches!(
            (self, &jwk.algorithm),
            (KeyFamily::Rsa, AlgorithmParameters::RSA(_))
                | (KeyFamily::Ec, AlgorithmParameters::EllipticCurve(_))
        )
    }
}

/// Pick the key that must have signed a token with this `kid`/`alg`.
pub fn select_signing_key<'a>(jwks: &'a JwkSet, kid: Option<&str>, alg: Algorithm) -> Option<&'a Jwk> {
    if let Some(kid) = kid {
        let key = jwks.find(kid);
        if key.is_none() {
            warn!(kid, "no key in the key set matches the token kid");
        }
        return key;
    }

    let family = KeyFamily::for_algorithm(alg)?;
    let candidates: Vec<&Jwk> = jwks
        .keys
        .iter()
        .filter(|jwk| family.matches(jwk))
        .filter(|jwk| matches!(jwk.common.public_key_use, Some(PublicKeyUse::Signature)))
        .collect();

    match candidates.as_slice() {
        [only] => Some(only),
        [] => {
            error!(?alg, "token has no kid and the key set holds no matching signing key");
            None
        }
        _ => {
            error!(
                ?alg,
                candidates = candidates.len(),
                "token has no kid and the key set holds several matching signing keys"
            );
            None
        }
    }
}

/// Verify the id token's signature. Claims are not checked here.
pub fn validate_signature(id_token: &str, jwks: &JwkSet) -> bool {
    if jwks.keys.is_empty() {
        warn!("key set is empty, cannot verify id token signature");
        return false;
    }

    let header = match decode_header(id_token) {
        Ok(header) => header,
        Err(e) => {
            debug!(error = %e, "id token header is not decodable");
            return false;
        }
    };

    if KeyFamily::for_algorithm(header.alg).is_none() {
        warn!(alg = ?header.alg, "unsupported id token signature algorithm");
        return false;
    }

    let Some(jwk) = select_signing_key(jwks, header.kid.as_deref(), header.alg) else {
        return false;
    };

    let key = match DecodingKey::from_jwk(jwk) {
        Ok(key) => key,
        Err(e) => {
            error!(kid = ?jwk.common.key_id, error = %e, "signing key is unusable");
            return false;
        }
    };

    let mut validation = Validation::new(header.alg);
    validation.algorithms = vec![header.alg];
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match decode::<Value>(id_token, &key, &validation) {
        Ok(_) => true,
        Err(e) => {
            debug!(kid = ?header.kid, error = %e, "id token signature rejected");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        ec_jwk, foreign_rsa_jwk, jwks, rsa_jwk, sign_ec, sign_rsa, sign_rsa_foreign,
    };
    use serde_json::json;

    fn claims() -> Value {
        json!({"iss": "https://op.example.com", "sub": "alice", "aud": "spa"})
    }

    #[test]
    fn accepts_token_signed_with_kid_key() {
        let token = sign_rsa(&claims(), Some("rsa-1"));
        assert!(validate_signature(&token, &jwks(vec![rsa_jwk(Some("rsa-1")), ec_jwk(Some("ec-1"))])));
    }

    #[test]
    fn accepts_sole_rsa_key_without_kid() {
        let token = sign_rsa(&claims(), None);
        assert!(validate_signature(&token, &jwks(vec![rsa_jwk(Some("rsa-1")), ec_jwk(Some("ec-1"))])));
    }

    #[test]
    fn accepts_ec_signature() {
        let token = sign_ec(&claims(), Some("ec-1"));
        assert!(validate_signature(&token, &jwks(vec![rsa_jwk(Some("rsa-1")), ec_jwk(Some("ec-1"))])));
    }

    #[test]
    fn rejects_token_signed_by_absent_key() {
        let token = sign_rsa_foreign(&claims(), Some("rsa-1"));
        assert!(!validate_signature(&token, &jwks(vec![rsa_jwk(Some("rsa-1"))])));
        let token = sign_rsa_foreign(&claims(), None);
        assert!(!validate_signature(&token, &jwks(vec![rsa_jwk(None)])));
    }

    #[test]
    fn rejects_unknown_kid() {
        let token = sign_rsa(&claims(), Some("rotated"));
        assert!(!validate_signature(&token, &jwks(vec![rsa_jwk(Some("rsa-1"))])));
    }

    #[test]
    fn ambiguous_key_set_without_kid_fails() {
        let token = sign_rsa(&claims(), None);
        let set = jwks(vec![rsa_jwk(Some("rsa-1")), foreign_rsa_jwk(Some("rsa-2"))]);
        assert!(!validate_signature(&token, &set));
        assert!(select_signing_key(&set, None, Algorithm::RS256).is_none());
    }

    #[test]
    fn empty_key_set_and_garbage_fail() {
        let token = sign_rsa(&claims(), Some("rsa-1"));
        assert!(!validate_signature(&token, &jwks(vec![])));
        assert!(!validate_signature("not.a.jwt", &jwks(vec![rsa_jwk(Some("rsa-1"))])));
    }

    #[test]
    fn tampered_payload_fails() {
        let token = sign_rsa(&claims(), Some("rsa-1"));
        let [header, _, signature] = crate::jwt::split(&token).unwrap();
        let forged = crate::test_support::encode_segment(&json!({"sub": "mallory"}));
        let tampered = format!("{header}.{forged}.{signature}");
        assert!(!validate_signature(&tampered, &jwks(vec![rsa_jwk(Some("rsa-1"))])));
    }

    #[test]
    fn family_of_algorithms() {
        assert_eq!(KeyFamily::for_algorithm(Algorithm::PS384), Some(KeyFamily::Rsa));
        assert_eq!(KeyFamily::for_algorithm(Algorithm::ES256), Some(KeyFamily::Ec));
        assert_eq!(KeyFamily::for_algorithm(Algorithm::HS256), None);
    }
}
