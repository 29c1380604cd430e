//! OpenID Connect relying-party protocol library
//!
//! Stateless protocol pieces plus the persisted flow state: random/PKCE
//! generation, the compact JWT codec, the claims validator and its fail-fast
//! pipeline, request URL construction, callback parsing, token endpoint calls
//! and the storage/transport/metadata collaborators. No background tasks live
//! here; the `oidc-session` crate drives these pieces.
//!
//! Code flow at a glance:
//! 1. `pkce::generate_state()` / `generate_nonce()` / `generate_verifier()`,
//!    persisted with `FlowStateStore::set_authorize_data()`
//! 2. `urls::build_authorize_url()` sends the user to the OP
//! 3. `callback::parse_callback()` reads the redirect
//! 4. `token::exchange_code()` trades the code for tokens
//! 5. `validation::validate_callback()` decides whether to trust them
//! 6. `FlowStateStore::commit_tokens()` persists them only if valid

pub mod callback;
pub mod claims;
pub mod config;
pub mod constants;
pub mod error;
pub mod flow_state;
pub mod jwt;
pub mod pkce;
pub mod signature;
pub mod storage;
pub mod token;
pub mod transport;
pub mod urls;
pub mod validation;
pub mod well_known;

#[cfg(test)]
mod test_support;

use std::time::{SystemTime, UNIX_EPOCH};

pub use callback::{AuthResult, CallbackContext, parse_callback};
pub use claims::ValidationResult;
pub use config::{FlowKind, OidcConfig, ResponseType};
pub use constants::*;
pub use error::{Error, Result};
pub use flow_state::{FlowState, FlowStateStore, TokenSet};
pub use jsonwebtoken::jwk::JwkSet;
pub use pkce::{compute_challenge, create_random, generate_nonce, generate_state, generate_verifier};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use transport::{BoxFuture, ReqwestTransport, Transport, TransportError};
pub use validation::{StateValidationResult, ValidationInput, validate_callback};
pub use well_known::{DiscoveryMetadata, MetadataSource, StaticMetadata, WellKnownEndpoints};

/// Seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
