//! Authentication orchestrator for one configuration
//!
//! Drives a login from the authorization URL to committed tokens: builds the
//! request, reads the callback, exchanges the code (or takes the implicit
//! fragment tokens), runs the validation pipeline and only then persists the
//! result. Every phase change goes through [`crate::state::next_phase`]; the
//! storage work each transition implies is executed by [`Orchestrator::run_action`].
//!
//! Failure handling:
//! - OP error responses and failed validations are verdicts: the attempt ends
//!   in `FlowPhase::Error` and authorization data is reset.
//! - Connectivity failures abort the attempt and are returned to the caller;
//!   committed tokens are left alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::Secret;
use oidc_auth::urls::{self, AuthorizeParams};
use oidc_auth::{
    CallbackContext, FlowKind, FlowState, FlowStateStore, LOGIN_REQUIRED_ERRORS, MetadataSource,
    OidcConfig, REFRESH_TOKEN_NONCE_SENTINEL, Storage, TokenSet, Transport, TransportError,
    ValidationInput, ValidationResult, WellKnownEndpoints, claims, jwt, now_secs, parse_callback,
    pkce, token, validate_callback,
};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::state::{FlowAction, FlowEvent, FlowPhase, OidcEvent, next_phase};

const EVENT_CAPACITY: usize = 64;

/// Result of one `check_auth` / renewal attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthOutcome {
    pub is_authenticated: bool,
    pub validation_result: ValidationResult,
    pub error_message: Option<String>,
    pub is_renew_process: bool,
    /// Route to send the user to, when result redirects are enabled.
    pub redirect_to: Option<String>,
}

/// Which stored tokens are expired (or expire within the checked offset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenExpiry {
    pub access_token: bool,
    pub id_token: bool,
}

impl TokenExpiry {
    pub fn any(&self) -> bool {
        self.access_token || self.id_token
    }
}

/// Compute expiry flags for a token set at `now`, looking `offset_secs` ahead.
pub fn token_expiry(tokens: &TokenSet, now: i64, offset_secs: u64) -> TokenExpiry {
    let horizon = now.saturating_add_unsigned(offset_secs);
    let id_token = tokens.id_token.as_deref().is_some_and(|id_token| {
        let claims = jwt::get_payload(Some(id_token), false);
        claims::numeric_claim(&claims, "exp").is_some_and(|exp| horizon >= exp)
    });
    let access_token = tokens
        .access_token_expires_at
        .is_some_and(|exp| horizon >= exp);
    TokenExpiry {
        access_token,
        id_token,
    }
}

/// `error`/`error_description` from a token-endpoint error response.
fn op_error_of(err: &oidc_auth::Error) -> Option<(String, Option<String>)> {
    match err {
        oidc_auth::Error::Transport(TransportError::Status { status, body }) => {
            Some(token::op_error_from_body(body).unwrap_or_else(|| {
                (
                    "server_error".to_owned(),
                    Some(format!("token endpoint returned {status}")),
                )
            }))
        }
        _ => None,
    }
}

/// Orchestrates authentication for one [`OidcConfig`].
pub struct Orchestrator {
    config: OidcConfig,
    store: FlowStateStore,
    transport: Arc<dyn Transport>,
    metadata: Arc<dyn MetadataSource>,
    phase: watch::Sender<FlowPhase>,
    events: broadcast::Sender<OidcEvent>,
    server_state_changed: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        config: OidcConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        metadata: Arc<dyn MetadataSource>,
    ) -> Self {
        let store = FlowStateStore::new(storage, &config.config_id);
        let (phase, _) = watch::channel(FlowPhase::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            store,
            transport,
            metadata,
            phase,
            events,
            server_state_changed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    pub fn config_id(&self) -> &str {
        &self.config.config_id
    }

    pub fn store(&self) -> &FlowStateStore {
        &self.store
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataSource> {
        &self.metadata
    }

    pub fn phase(&self) -> FlowPhase {
        self.phase.borrow().clone()
    }

    pub fn watch_phase(&self) -> watch::Receiver<FlowPhase> {
        self.phase.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OidcEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: OidcEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Whether the session monitor has seen the OP session change.
    pub fn server_state_changed(&self) -> bool {
        self.server_state_changed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_server_state_changed(&self, changed: bool) {
        self.server_state_changed.store(changed, Ordering::SeqCst);
    }

    fn transition(&self, event: FlowEvent) -> FlowAction {
        let mut action = FlowAction::None;
        let config_id = self.config_id();
        self.phase.send_modify(|phase| {
            let (next, next_action) = next_phase(phase.clone(), event);
            if *phase != next {
                debug!(config_id, from = phase.label(), to = next.label(), "flow phase transition");
            }
            *phase = next;
            action = next_action;
        });
        action
    }

    async fn run_action(
        &self,
        action: FlowAction,
        tokens: Option<TokenSet>,
        session_state: Option<String>,
    ) -> Result<()> {
        match action {
            FlowAction::CommitTokens => {
                if let Some(tokens) = tokens {
                    self.store.commit_tokens(tokens, session_state).await?;
                }
            }
            FlowAction::ResetAuthorizationData => self.store.reset_authorization_data().await?,
            FlowAction::ResetFlowState => self.store.reset().await?,
            FlowAction::None => {}
        }
        Ok(())
    }

    async fn require_well_known(&self) -> Result<WellKnownEndpoints> {
        self.metadata.well_known().await?.ok_or_else(|| {
            Error::from(oidc_auth::Error::Metadata(format!(
                "no well-known endpoints for {}",
                self.config.config_id
            )))
        })
    }

    fn silent_redirect_uri(&self) -> &str {
        self.config
            .silent_renew_url
            .as_deref()
            .unwrap_or(&self.config.redirect_url)
    }

    async fn prepare_authorize_url(
        &self,
        redirect_uri: &str,
        prompt: Option<&str>,
        custom_params: &[(String, String)],
    ) -> Result<String> {
        let well_known = self.require_well_known().await?;
        let endpoint = well_known.require(
            well_known.authorization_endpoint.as_deref(),
            "authorization_endpoint",
        )?;

        let state = pkce::generate_state();
        let nonce = pkce::generate_nonce();
        let verifier = self.config.use_pkce.then(pkce::generate_verifier);
        let challenge = verifier.as_deref().map(pkce::compute_challenge);

        let mut custom = self.config.custom_params_auth_request.clone();
        custom.extend(custom_params.iter().cloned());

        let url = urls::build_authorize_url(&AuthorizeParams {
            authorization_endpoint: endpoint,
            client_id: &self.config.client_id,
            redirect_uri,
            response_type: self.config.response_type.as_str(),
            scope: &self.config.scope,
            nonce: &nonce,
            state: &state,
            code_challenge: challenge.as_deref(),
            prompt,
            custom: &custom,
        })?;

        self.store.set_authorize_data(nonce, state, verifier).await?;
        Ok(url)
    }

    /// Generate and persist state, nonce and PKCE verifier, and return the
    /// authorization URL to send the user to.
    pub async fn authorize(&self, custom_params: &[(String, String)]) -> Result<String> {
        let url = self
            .prepare_authorize_url(&self.config.redirect_url, None, custom_params)
            .await?;
        self.transition(FlowEvent::AuthorizeRequested);
        info!(config_id = self.config_id(), "authorization requested");
        Ok(url)
    }

    /// `prompt=none` authorization URL targeting the silent-renew redirect.
    pub async fn silent_authorize_url(&self, custom_params: &[(String, String)]) -> Result<String> {
        self.prepare_authorize_url(self.silent_redirect_uri(), Some("none"), custom_params)
            .await
    }

    /// Process a callback URL, or with `None` report whether stored tokens
    /// still form a valid session.
    pub async fn check_auth(&self, callback_url: Option<&str>) -> Result<AuthOutcome> {
        self.publish(OidcEvent::CheckingAuth);
        let params = callback_url.map(parse_callback).filter(|p| !p.is_empty());
        let result = match params {
            Some(params) => self.process_callback(params, false).await,
            None => self.restore_session().await,
        };
        match &result {
            Ok(_) => self.publish(OidcEvent::CheckingAuthFinished),
            Err(e) => self.publish(OidcEvent::CheckingAuthFinishedWithError(e.to_string())),
        }
        result
    }

    /// Process the callback of a silent (iframe) renewal.
    pub async fn check_auth_renew(&self, callback_url: &str) -> Result<AuthOutcome> {
        self.process_callback(parse_callback(callback_url), true).await
    }

    async fn restore_session(&self) -> Result<AuthOutcome> {
        let stored = self.store.load().await?;
        let valid = !stored.tokens.is_empty() && !token_expiry(&stored.tokens, now_secs(), 0).any();
        if valid {
            self.transition(FlowEvent::SessionRestored);
            debug!(config_id = self.config_id(), "stored session is valid");
        }
        Ok(AuthOutcome {
            is_authenticated: valid,
            validation_result: if valid {
                ValidationResult::Ok
            } else {
                ValidationResult::NotSet
            },
            error_message: None,
            is_renew_process: false,
            redirect_to: None,
        })
    }

    async fn process_callback(
        &self,
        params: HashMap<String, String>,
        is_renew: bool,
    ) -> Result<AuthOutcome> {
        let flow = FlowKind::for_response_type(self.config.response_type);
        let context = CallbackContext::from_redirect(flow, &params, is_renew);

        // an OP error only counts when it answers our own request
        if let Some(error) = context.op_error() {
            let stored = self.store.load().await?;
            if !claims::validate_state(context.state.as_deref(), stored.state_control.as_deref()) {
                warn!(
                    config_id = self.config_id(),
                    error,
                    "ignoring OP error callback with unknown state"
                );
                return Ok(AuthOutcome {
                    is_authenticated: false,
                    validation_result: ValidationResult::StatesDoNotMatch,
                    error_message: Some(format!("unsolicited error callback: {error}")),
                    is_renew_process: is_renew,
                    redirect_to: None,
                });
            }
        }

        self.transition(FlowEvent::ValidationStarted {
            kind: flow,
            renew: is_renew,
        });

        match self.process_callback_context(context).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.abort(e, is_renew).await),
        }
    }

    async fn process_callback_context(&self, mut context: CallbackContext) -> Result<AuthOutcome> {
        let is_renew = context.is_renew_process;
        if let Some(error) = context.op_error() {
            let error = error.to_owned();
            let description = context.auth_result.error_description.clone();
            return self.reject_op_error(&error, description, is_renew).await;
        }

        let stored = self.store.load().await?;
        if context.flow == FlowKind::Code {
            // never redeem a code that answers someone else's request
            if !claims::validate_state(context.state.as_deref(), stored.state_control.as_deref()) {
                return self
                    .reject(ValidationResult::StatesDoNotMatch, None, is_renew)
                    .await;
            }
            let code = context.code.clone().ok_or_else(|| {
                oidc_auth::Error::InvalidCallback("callback carries neither code nor error".into())
            })?;

            let well_known = self.require_well_known().await?;
            let token_endpoint =
                well_known.require(well_known.token_endpoint.as_deref(), "token_endpoint")?;
            let redirect_uri = if is_renew {
                self.silent_redirect_uri()
            } else {
                &self.config.redirect_url
            };
            let verifier = if self.config.use_pkce {
                stored.code_verifier()
            } else {
                None
            };

            match token::exchange_code(
                self.transport.as_ref(),
                token_endpoint,
                &self.config,
                &code,
                verifier,
                redirect_uri,
            )
            .await
            {
                Ok(result) => context.auth_result = result,
                Err(e) => {
                    let Some((error, description)) = op_error_of(&e) else {
                        return Err(e.into());
                    };
                    return self.reject_op_error(&error, description, is_renew).await;
                }
            }
        }

        self.validate_and_commit(context, &stored).await
    }

    /// Refresh-token grant, validated and committed like a callback.
    pub async fn refresh_session_with_refresh_token(
        &self,
        custom_params: &[(String, String)],
    ) -> Result<AuthOutcome> {
        let stored = self.store.load().await?;
        let Some(refresh_token) = stored.tokens.refresh_token.clone() else {
            error!(config_id = self.config_id(), "no refresh token found, please login");
            return Err(oidc_auth::Error::NoRefreshToken.into());
        };

        let state_control = self.store.existing_or_create_state_control().await?;
        self.store.set_nonce(REFRESH_TOKEN_NONCE_SENTINEL).await?;
        let context =
            CallbackContext::for_refresh(refresh_token, state_control, stored.tokens.id_token.clone());
        self.transition(FlowEvent::ValidationStarted {
            kind: FlowKind::Refresh,
            renew: true,
        });

        match self.refresh_with_context(context, custom_params).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.abort(e, true).await),
        }
    }

    async fn refresh_with_context(
        &self,
        mut context: CallbackContext,
        custom_params: &[(String, String)],
    ) -> Result<AuthOutcome> {
        let well_known = self.require_well_known().await?;
        let token_endpoint =
            well_known.require(well_known.token_endpoint.as_deref(), "token_endpoint")?;
        let refresh_token = context.refresh_token.clone();
        let refresh_token = refresh_token
            .as_ref()
            .map(Secret::expose_str)
            .unwrap_or_default();

        match token::refresh_tokens(
            self.transport.as_ref(),
            token_endpoint,
            &self.config,
            refresh_token,
            custom_params,
        )
        .await
        {
            Ok(result) => context.auth_result = result,
            Err(e) => {
                let Some((error, description)) = op_error_of(&e) else {
                    return Err(e.into());
                };
                return self.reject_op_error(&error, description, true).await;
            }
        }

        let stored = self.store.load().await?;
        self.validate_and_commit(context, &stored).await
    }

    async fn validate_and_commit(
        &self,
        context: CallbackContext,
        stored: &FlowState,
    ) -> Result<AuthOutcome> {
        let is_renew = context.is_renew_process;
        let well_known = self.metadata.well_known().await?;
        let jwks = match context.jwt_keys.clone() {
            Some(jwks) => jwks,
            None => self.metadata.jwks().await?,
        };
        let now = now_secs();

        let verdict = validate_callback(&ValidationInput {
            config: &self.config,
            flow: context.flow,
            returned_state: context.state.as_deref(),
            expected_state: stored.state_control.as_deref(),
            expected_nonce: stored.nonce.as_deref(),
            access_token: context.auth_result.access_token(),
            id_token: context.auth_result.id_token.as_deref(),
            existing_id_token: context.existing_id_token.as_deref(),
            well_known: well_known.as_ref(),
            jwks: &jwks,
            now,
        });
        self.store
            .clear_after_validation(self.config.auto_clean_state_after_authentication)
            .await?;

        if !verdict.auth_response_is_valid {
            return self.reject(verdict.state, None, is_renew).await;
        }

        let mut user_data = None;
        if self.config.auto_user_info && !is_renew {
            let endpoint = well_known
                .as_ref()
                .and_then(|w| w.userinfo_endpoint.as_deref());
            if let (Some(endpoint), Some(access_token)) = (endpoint, verdict.access_token.as_deref()) {
                let info = token::fetch_user_info(self.transport.as_ref(), endpoint, access_token).await?;
                let id_sub = verdict.decoded_id_token.get("sub");
                if id_sub.is_none() || info.get("sub") != id_sub {
                    warn!(config_id = self.config_id(), "userinfo subject does not match id token");
                    return self
                        .reject(
                            ValidationResult::NotSet,
                            Some("userinfo subject does not match id token".into()),
                            is_renew,
                        )
                        .await;
                }
                user_data = Some(info);
            }
        }

        let tokens = TokenSet {
            access_token: context.auth_result.access_token.clone(),
            id_token: context.auth_result.id_token.clone(),
            refresh_token: context.auth_result.refresh_token.clone(),
            access_token_expires_at: context
                .auth_result
                .expires_in
                .map(|secs| now.saturating_add_unsigned(secs)),
        };
        let action = self.transition(FlowEvent::ValidationSucceeded);
        if action != FlowAction::CommitTokens {
            warn!(config_id = self.config_id(), "flow left validation before commit, discarding tokens");
            return Ok(AuthOutcome {
                is_authenticated: false,
                validation_result: ValidationResult::NotSet,
                error_message: Some("flow was reset during validation".into()),
                is_renew_process: is_renew,
                redirect_to: None,
            });
        }
        self.run_action(action, Some(tokens), context.session_state.clone())
            .await?;

        if user_data.is_some() {
            self.store.set_user_data(user_data.clone()).await?;
            self.publish(OidcEvent::UserDataChanged(user_data));
        }
        self.set_server_state_changed(false);

        metrics::counter!("oidc_validation_total", "result" => ValidationResult::Ok.label()).increment(1);
        info!(
            config_id = self.config_id(),
            flow = context.flow.label(),
            renew = is_renew,
            "authenticated"
        );
        self.publish(OidcEvent::NewAuthenticationResult {
            is_authenticated: true,
            validation_result: ValidationResult::Ok,
            is_renew_process: is_renew,
        });

        Ok(AuthOutcome {
            is_authenticated: true,
            validation_result: ValidationResult::Ok,
            error_message: None,
            is_renew_process: is_renew,
            redirect_to: (self.config.trigger_authorization_result_redirect && !is_renew)
                .then(|| self.config.post_login_route.clone()),
        })
    }

    async fn reject(
        &self,
        result: ValidationResult,
        message: Option<String>,
        is_renew: bool,
    ) -> Result<AuthOutcome> {
        let action = self.transition(FlowEvent::ValidationFailed(result));
        self.run_action(action, None, None).await?;

        metrics::counter!("oidc_validation_total", "result" => result.label()).increment(1);
        warn!(
            config_id = self.config_id(),
            result = result.label(),
            renew = is_renew,
            "authentication failed"
        );
        self.publish(OidcEvent::NewAuthenticationResult {
            is_authenticated: false,
            validation_result: result,
            is_renew_process: is_renew,
        });

        Ok(AuthOutcome {
            is_authenticated: false,
            validation_result: result,
            error_message: message,
            is_renew_process: is_renew,
            redirect_to: (self.config.trigger_authorization_result_redirect && !is_renew)
                .then(|| self.config.unauthorized_route.clone()),
        })
    }

    async fn reject_op_error(
        &self,
        error: &str,
        description: Option<String>,
        is_renew: bool,
    ) -> Result<AuthOutcome> {
        let result = if LOGIN_REQUIRED_ERRORS.contains(&error) {
            ValidationResult::LoginRequired
        } else {
            ValidationResult::SecureTokenServerError
        };
        self.store
            .clear_after_validation(self.config.auto_clean_state_after_authentication)
            .await?;
        let message = match description {
            Some(description) => format!("{error}: {description}"),
            None => error.to_owned(),
        };
        self.reject(result, Some(message), is_renew).await
    }

    async fn abort(&self, err: Error, is_renew: bool) -> Error {
        let transient = err.is_network();
        self.transition(FlowEvent::Aborted { transient });
        if let Err(e) = self
            .store
            .clear_after_validation(self.config.auto_clean_state_after_authentication)
            .await
        {
            warn!(config_id = self.config_id(), error = %e, "failed to clear flow state after abort");
        }
        warn!(
            config_id = self.config_id(),
            error = %err,
            transient,
            renew = is_renew,
            "authentication attempt aborted"
        );
        err
    }

    /// Log off: clear local state and return the OP end-session URL to
    /// redirect to. Returns `None` (local logoff only) when the OP has no
    /// end-session endpoint or its session already changed.
    pub async fn logoff(&self, custom_params: &[(String, String)]) -> Result<Option<String>> {
        let stored = self.store.load().await?;
        let end_session = self
            .metadata
            .well_known()
            .await?
            .and_then(|w| w.end_session_endpoint);

        let url = match end_session {
            None => {
                debug!(config_id = self.config_id(), "no end_session_endpoint, local logoff only");
                None
            }
            Some(_) if self.server_state_changed() => {
                info!(
                    config_id = self.config_id(),
                    "server session changed, only local login cleaned up"
                );
                None
            }
            Some(endpoint) => {
                let mut custom = self.config.custom_params_end_session_request.clone();
                custom.extend(custom_params.iter().cloned());
                Some(urls::build_end_session_url(
                    &endpoint,
                    stored.tokens.id_token.as_deref(),
                    self.config.post_logout_redirect_uri.as_deref(),
                    &custom,
                )?)
            }
        };

        self.logoff_local().await?;
        Ok(url)
    }

    /// Drop all local state for this configuration without contacting the OP.
    pub async fn logoff_local(&self) -> Result<()> {
        let action = self.transition(FlowEvent::LoggedOff);
        self.run_action(action, None, None).await?;
        self.set_server_state_changed(false);
        self.publish(OidcEvent::UserDataChanged(None));
        self.publish(OidcEvent::NewAuthenticationResult {
            is_authenticated: false,
            validation_result: ValidationResult::NotSet,
            is_renew_process: false,
        });
        info!(config_id = self.config_id(), "logged off");
        Ok(())
    }

    /// Revoke the refresh token, then the access token, then log off.
    pub async fn logoff_and_revoke_tokens(
        &self,
        custom_params: &[(String, String)],
    ) -> Result<Option<String>> {
        let well_known = self.require_well_known().await?;
        let endpoint =
            well_known.require(well_known.revocation_endpoint.as_deref(), "revocation_endpoint")?;
        let stored = self.store.load().await?;

        if let Some(refresh_token) = stored.tokens.refresh_token() {
            token::revoke_token(
                self.transport.as_ref(),
                endpoint,
                &self.config.client_id,
                refresh_token,
                "refresh_token",
            )
            .await?;
        }
        if let Some(access_token) = stored.tokens.access_token() {
            token::revoke_token(
                self.transport.as_ref(),
                endpoint,
                &self.config.client_id,
                access_token,
                "access_token",
            )
            .await?;
        }

        self.logoff(custom_params).await
    }

    /// Whether validated tokens are committed for this configuration.
    pub async fn is_authenticated(&self) -> Result<bool> {
        Ok(!self.store.load().await?.tokens.is_empty())
    }

    pub async fn access_token(&self) -> Result<Option<Secret<String>>> {
        Ok(self.store.load().await?.tokens.access_token)
    }

    pub async fn id_token(&self) -> Result<Option<String>> {
        Ok(self.store.load().await?.tokens.id_token)
    }

    pub async fn refresh_token(&self) -> Result<Option<Secret<String>>> {
        Ok(self.store.load().await?.tokens.refresh_token)
    }

    pub async fn user_data(&self) -> Result<Option<Value>> {
        Ok(self.store.load().await?.user_data)
    }

    /// Decoded claims of the stored id token (`{}` when there is none).
    pub async fn id_token_claims(&self) -> Result<Value> {
        let id_token = self.id_token().await?;
        Ok(jwt::get_payload(id_token.as_deref(), false))
    }

    /// Expiry of the stored tokens, looking `offset_secs` ahead of `now`.
    pub async fn token_expiry(&self, now: i64, offset_secs: u64) -> Result<TokenExpiry> {
        let stored = self.store.load().await?;
        Ok(token_expiry(&stored.tokens, now, offset_secs))
    }
}
