//! Random values and PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! `state`, nonces and code verifiers all come from [`create_random`], which
//! draws from the OS-seeded thread RNG and maps bytes onto the URL-safe base64
//! alphabet. The alphabet has 64 symbols, so `byte % 64` is unbiased.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::constants::{
    CODE_VERIFIER_LENGTH, FALLBACK_RANDOM_LENGTH, MIN_RANDOM_LENGTH, NONCE_LENGTH, STATE_LENGTH,
};

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Create a random string of exactly `length` URL-safe characters.
///
/// - `length == 0` returns an empty string (callers use it to skip nonce generation).
/// - `1..MIN_RANDOM_LENGTH` is too weak for anti-CSRF use: a warning is logged
///   and `FALLBACK_RANDOM_LENGTH` characters are returned instead.
pub fn create_random(length: usize) -> String {
    if length == 0 {
        return String::new();
    }

    let length = if length < MIN_RANDOM_LENGTH {
        warn!(
            requested = length,
            minimum = MIN_RANDOM_LENGTH,
            returned = FALLBACK_RANDOM_LENGTH,
            "random value requested below minimum length"
        );
        FALLBACK_RANDOM_LENGTH
    } else {
        length
    };

    let mut bytes = vec![0u8; length];
    rand::rng().fill(bytes.as_mut_slice());
    bytes
        .into_iter()
        .map(|b| ALPHABET[(b % 64) as usize] as char)
        .collect()
}

/// Anti-CSRF correlation value sent as `state`.
pub fn generate_state() -> String {
    create_random(STATE_LENGTH)
}

/// Replay-protection value sent as `nonce` and echoed in the id-token.
pub fn generate_nonce() -> String {
    create_random(NONCE_LENGTH)
}

/// Generate a PKCE code verifier.
pub fn generate_verifier() -> String {
    create_random(CODE_VERIFIER_LENGTH)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}
