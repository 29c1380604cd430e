//! Per-configuration flow state
//!
//! [`FlowState`] is everything that must survive the redirect round-trip:
//! anti-CSRF material, the PKCE verifier, the renewal flag and the committed
//! token set. [`FlowStateStore`] persists it through the storage collaborator
//! under the configuration id and serializes read-modify-write cycles so the
//! orchestrator, renew coordinator and session monitor never interleave a
//! mutation.

use std::sync::Arc;

use common::Secret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pkce;
use crate::storage::Storage;

/// Tokens committed after a successful validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    #[serde(default)]
    pub access_token: Option<Secret<String>>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    /// Access token expiry, Unix seconds.
    #[serde(default)]
    pub access_token_expires_at: Option<i64>,
}

impl TokenSet {
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_ref().map(Secret::expose_str)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_ref().map(Secret::expose_str)
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.id_token.is_none()
    }
}

/// Persisted state for one configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub state_control: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<Secret<String>>,
    #[serde(default)]
    pub session_state: Option<String>,
    /// Set while a renewal runs, Unix seconds of its start.
    #[serde(default)]
    pub silent_renew_started_at: Option<i64>,
    #[serde(default)]
    pub tokens: TokenSet,
    #[serde(default)]
    pub user_data: Option<Value>,
}

impl FlowState {
    /// Whether a renewal flag is set and younger than `timeout_secs`.
    pub fn silent_renew_running(&self, now: i64, timeout_secs: u64) -> bool {
        self.silent_renew_started_at
            .is_some_and(|started| now.saturating_sub(started) < timeout_secs as i64)
    }

    pub fn code_verifier(&self) -> Option<&str> {
        self.code_verifier.as_ref().map(Secret::expose_str)
    }
}

/// Flow state for one configuration, persisted through [`Storage`].
pub struct FlowStateStore {
    storage: Arc<dyn Storage>,
    key: String,
    lock: Mutex<()>,
}

impl FlowStateStore {
    pub fn new(storage: Arc<dyn Storage>, config_id: &str) -> Self {
        Self {
            storage,
            key: format!("oidc-flow-state:{config_id}"),
            lock: Mutex::new(()),
        }
    }

    /// Storage key this configuration's state lives under.
    pub fn key(&self) -> &str {
        &self.key
    }

    async fn read(&self) -> Result<FlowState> {
        match self.storage.read(&self.key).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::Storage(format!("flow state under {} is corrupt: {e}", self.key))),
            None => Ok(FlowState::default()),
        }
    }

    async fn write(&self, state: &FlowState) -> Result<()> {
        let value = serde_json::to_value(state)
            .map_err(|e| Error::Storage(format!("serializing flow state: {e}")))?;
        self.storage.write(&self.key, value).await
    }

    /// Current state; absent storage reads as the default state.
    pub async fn load(&self) -> Result<FlowState> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Atomic read-modify-write.
    pub async fn update<R>(&self, mutate: impl FnOnce(&mut FlowState) -> R) -> Result<R> {
        let _guard = self.lock.lock().await;
        let mut state = self.read().await?;
        let result = mutate(&mut state);
        self.write(&state).await?;
        Ok(result)
    }

    /// Drop everything stored for this configuration.
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        debug!(key = %self.key, "flow state reset");
        self.storage.remove(&self.key).await
    }

    /// Persist fresh anti-CSRF material before redirecting to the OP.
    pub async fn set_authorize_data(
        &self,
        nonce: String,
        state_control: String,
        code_verifier: Option<String>,
    ) -> Result<()> {
        self.update(|state| {
            state.nonce = Some(nonce);
            state.state_control = Some(state_control);
            state.code_verifier = code_verifier.map(Secret::new);
        })
        .await
    }

    pub async fn set_nonce(&self, nonce: &str) -> Result<()> {
        self.update(|state| state.nonce = Some(nonce.to_owned())).await
    }

    /// Stored state control, generating and persisting one when absent.
    pub async fn existing_or_create_state_control(&self) -> Result<String> {
        self.update(|state| {
            state
                .state_control
                .get_or_insert_with(pkce::generate_state)
                .clone()
        })
        .await
    }

    /// Claim the renewal flag. Returns `false` if a fresh flag is already set;
    /// a flag older than `timeout_secs` is considered abandoned and replaced.
    pub async fn try_start_silent_renew(&self, now: i64, timeout_secs: u64) -> Result<bool> {
        self.update(|state| {
            if state.silent_renew_running(now, timeout_secs) {
                return false;
            }
            if let Some(started) = state.silent_renew_started_at {
                warn!(started, now, "replacing stale silent renew flag");
            }
            state.silent_renew_started_at = Some(now);
            true
        })
        .await
    }

    pub async fn finish_silent_renew(&self) -> Result<()> {
        self.update(|state| state.silent_renew_started_at = None).await
    }

    pub async fn is_silent_renew_running(&self, now: i64, timeout_secs: u64) -> Result<bool> {
        Ok(self.load().await?.silent_renew_running(now, timeout_secs))
    }

    /// Store a validated token set.
    ///
    /// Only called once the response validated. A refresh response without a
    /// new refresh token keeps the existing one.
    pub async fn commit_tokens(&self, tokens: TokenSet, session_state: Option<String>) -> Result<()> {
        self.update(|state| {
            let refresh_token = tokens.refresh_token.or_else(|| state.tokens.refresh_token.take());
            let id_token = tokens.id_token.or_else(|| state.tokens.id_token.take());
            state.tokens = TokenSet {
                access_token: tokens.access_token,
                id_token,
                refresh_token,
                access_token_expires_at: tokens.access_token_expires_at,
            };
            if session_state.is_some() {
                state.session_state = session_state;
            }
        })
        .await
    }

    pub async fn set_user_data(&self, user_data: Option<Value>) -> Result<()> {
        self.update(|state| state.user_data = user_data).await
    }

    /// Clear tokens and everything tied to the authenticated session.
    pub async fn reset_authorization_data(&self) -> Result<()> {
        self.update(|state| {
            state.tokens = TokenSet::default();
            state.user_data = None;
            state.session_state = None;
            state.code_verifier = None;
            state.silent_renew_started_at = None;
        })
        .await
    }

    /// Post-validation cleanup, run on success and failure alike.
    pub async fn clear_after_validation(&self, clear_state_control: bool) -> Result<()> {
        self.update(|state| {
            state.nonce = None;
            if clear_state_control {
                state.state_control = None;
            }
        })
        .await
    }
}
