//! Protocol constants
//!
//! Values fixed by the engine rather than by a client registration. Per-client
//! settings live in [`crate::config::OidcConfig`].

/// Nonce stored in flow state while a refresh-token grant is validated.
///
/// Refreshed id-tokens usually carry no nonce; the validator recognises this
/// sentinel and exempts the token from the nonce match.
pub const REFRESH_TOKEN_NONCE_SENTINEL: &str = "--RefreshToken--";

/// Shortest random value accepted for anti-CSRF material.
pub const MIN_RANDOM_LENGTH: usize = 7;

/// Length substituted when a caller asks for fewer than `MIN_RANDOM_LENGTH` characters.
pub const FALLBACK_RANDOM_LENGTH: usize = 10;

/// Length of generated `state` values.
pub const STATE_LENGTH: usize = 40;

/// Length of generated nonces.
pub const NONCE_LENGTH: usize = 40;

/// Length of generated PKCE code verifiers (RFC 7636 allows 43-128).
pub const CODE_VERIFIER_LENGTH: usize = 67;

/// PKCE challenge method, the only one this engine emits.
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// Unacknowledged check-session messages tolerated before the OP is treated as unreachable.
pub const MAX_OUTSTANDING_SESSION_MESSAGES: u32 = 3;

/// Delay before the single retry of a refresh-token grant that hit a network error.
pub const REFRESH_RETRY_DELAY_SECS: u64 = 3;

/// Path appended to the authority for OIDC discovery.
pub const WELL_KNOWN_SUFFIX: &str = "/.well-known/openid-configuration";

/// OP `error` codes that mean the user has to sign in interactively.
pub const LOGIN_REQUIRED_ERRORS: &[&str] = &[
    "login_required",
    "consent_required",
    "interaction_required",
    "account_selection_required",
];
