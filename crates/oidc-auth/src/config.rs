//! Relying-party registration settings
//!
//! One [`OidcConfig`] per client registration. Several may coexist; each is
//! identified by `config_id`, which also namespaces its flow state in storage.
//! Immutable once the engine is built.

use serde::Deserialize;

/// OAuth2 `response_type` values this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ResponseType {
    #[serde(rename = "code")]
    Code,
    #[serde(rename = "id_token token")]
    IdTokenToken,
    #[serde(rename = "id_token")]
    IdToken,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Code => "code",
            ResponseType::IdTokenToken => "id_token token",
            ResponseType::IdToken => "id_token",
        }
    }

    pub fn is_code_flow(&self) -> bool {
        matches!(self, ResponseType::Code)
    }

    /// Implicit flow that also returns an access token (at_hash is mandatory).
    pub fn is_implicit_with_access_token(&self) -> bool {
        matches!(self, ResponseType::IdTokenToken)
    }
}

/// Which path produced the tokens being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Authorization code exchanged at the token endpoint.
    Code,
    /// Tokens delivered in the redirect fragment.
    Implicit,
    /// Refresh-token grant at the token endpoint.
    Refresh,
}

impl FlowKind {
    /// Callback flow implied by a response type.
    pub fn for_response_type(response_type: ResponseType) -> Self {
        if response_type.is_code_flow() {
            FlowKind::Code
        } else {
            FlowKind::Implicit
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FlowKind::Code => "code",
            FlowKind::Implicit => "implicit",
            FlowKind::Refresh => "refresh",
        }
    }
}

/// Settings for one relying-party registration.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcConfig {
    /// Namespace for flow state; defaults to the client id.
    #[serde(default)]
    pub config_id: String,
    /// Issuer / authority base URL.
    pub authority: String,
    pub client_id: String,
    pub redirect_url: String,
    #[serde(default)]
    pub post_logout_redirect_uri: Option<String>,
    #[serde(default)]
    pub silent_renew_url: Option<String>,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_response_type")]
    pub response_type: ResponseType,
    #[serde(default = "default_true")]
    pub use_pkce: bool,
    #[serde(default)]
    pub use_refresh_token: bool,
    #[serde(default)]
    pub silent_renew: bool,
    #[serde(default = "default_silent_renew_timeout")]
    pub silent_renew_timeout_secs: u64,
    #[serde(default = "default_renew_before_expiry")]
    pub renew_time_before_token_expires_secs: u64,
    #[serde(default = "default_token_refresh_interval")]
    pub token_refresh_interval_secs: u64,
    #[serde(default)]
    pub start_check_session: bool,
    #[serde(default = "default_check_session_interval")]
    pub check_session_interval_secs: u64,
    #[serde(default = "default_check_session_reload")]
    pub check_session_reload_secs: u64,
    /// Leeway applied to `exp`.
    #[serde(default)]
    pub clock_skew_secs: u64,
    #[serde(default = "default_iat_offset")]
    pub max_id_token_iat_offset_secs: u64,
    #[serde(default)]
    pub disable_iat_offset_validation: bool,
    /// Skip the issuer check. Discouraged; logged on every use.
    #[serde(default)]
    pub iss_validation_off: bool,
    /// Accept refreshed id-tokens regardless of their nonce. Logged on every use.
    #[serde(default)]
    pub ignore_nonce_after_refresh: bool,
    #[serde(default = "default_true")]
    pub auto_clean_state_after_authentication: bool,
    #[serde(default = "default_true")]
    pub auto_user_info: bool,
    #[serde(default = "default_post_login_route")]
    pub post_login_route: String,
    #[serde(default = "default_unauthorized_route")]
    pub unauthorized_route: String,
    #[serde(default = "default_true")]
    pub trigger_authorization_result_redirect: bool,
    #[serde(default)]
    pub custom_params_auth_request: Vec<(String, String)>,
    #[serde(default)]
    pub custom_params_refresh_token_request: Vec<(String, String)>,
    #[serde(default)]
    pub custom_params_end_session_request: Vec<(String, String)>,
    #[serde(default)]
    pub custom_params_code_request: Vec<(String, String)>,
}

fn default_scope() -> String {
    "openid profile email".into()
}

fn default_response_type() -> ResponseType {
    ResponseType::Code
}

fn default_true() -> bool {
    true
}

fn default_silent_renew_timeout() -> u64 {
    20
}

fn default_renew_before_expiry() -> u64 {
    30
}

fn default_token_refresh_interval() -> u64 {
    4
}

fn default_check_session_interval() -> u64 {
    3
}

fn default_check_session_reload() -> u64 {
    60
}

fn default_iat_offset() -> u64 {
    120
}

fn default_post_login_route() -> String {
    "/".into()
}

fn default_unauthorized_route() -> String {
    "/unauthorized".into()
}

impl OidcConfig {
    /// Minimal configuration with every optional setting at its default.
    pub fn new(
        authority: impl Into<String>,
        client_id: impl Into<String>,
        redirect_url: impl Into<String>,
    ) -> Self {
        let client_id = client_id.into();
        Self {
            config_id: client_id.clone(),
            authority: authority.into(),
            client_id,
            redirect_url: redirect_url.into(),
            post_logout_redirect_uri: None,
            silent_renew_url: None,
            scope: default_scope(),
            response_type: default_response_type(),
            use_pkce: true,
            use_refresh_token: false,
            silent_renew: false,
            silent_renew_timeout_secs: default_silent_renew_timeout(),
            renew_time_before_token_expires_secs: default_renew_before_expiry(),
            token_refresh_interval_secs: default_token_refresh_interval(),
            start_check_session: false,
            check_session_interval_secs: default_check_session_interval(),
            check_session_reload_secs: default_check_session_reload(),
            clock_skew_secs: 0,
            max_id_token_iat_offset_secs: default_iat_offset(),
            disable_iat_offset_validation: false,
            iss_validation_off: false,
            ignore_nonce_after_refresh: false,
            auto_clean_state_after_authentication: true,
            auto_user_info: true,
            post_login_route: default_post_login_route(),
            unauthorized_route: default_unauthorized_route(),
            trigger_authorization_result_redirect: true,
            custom_params_auth_request: Vec::new(),
            custom_params_refresh_token_request: Vec::new(),
            custom_params_end_session_request: Vec::new(),
            custom_params_code_request: Vec::new(),
        }
    }

    /// Check required fields and normalise `config_id`.
    ///
    /// Called once after deserialization; the engine assumes a validated config.
    pub fn validate(mut self) -> common::Result<Self> {
        if self.config_id.is_empty() {
            self.config_id = self.client_id.clone();
        }
        for (field, value) in [
            ("authority", &self.authority),
            ("client_id", &self.client_id),
            ("redirect_url", &self.redirect_url),
        ] {
            if value.trim().is_empty() {
                return Err(common::Error::MissingField {
                    config_id: self.config_id.clone(),
                    field,
                });
            }
        }

        for (field, value) in [
            ("authority", Some(&self.authority)),
            ("redirect_url", Some(&self.redirect_url)),
            ("silent_renew_url", self.silent_renew_url.as_ref()),
        ] {
            if let Some(value) = value
                && !value.starts_with("http://")
                && !value.starts_with("https://")
            {
                return Err(common::Error::Config(format!(
                    "{field} must start with http:// or https:// for {}, got: {value}",
                    self.config_id
                )));
            }
        }

        if !self.scope.split_whitespace().any(|s| s == "openid") {
            return Err(common::Error::Config(format!(
                "scope must contain openid for {}",
                self.config_id
            )));
        }

        if self.silent_renew && !self.use_refresh_token && self.silent_renew_url.is_none() {
            return Err(common::Error::Config(format!(
                "silent_renew without refresh tokens requires silent_renew_url for {}",
                self.config_id
            )));
        }

        if self.check_session_interval_secs == 0 || self.token_refresh_interval_secs == 0 {
            return Err(common::Error::Config(format!(
                "polling intervals must be greater than 0 for {}",
                self.config_id
            )));
        }

        // a zero timeout would treat every held renewal flag as stale
        if self.silent_renew_timeout_secs == 0 {
            return Err(common::Error::Config(format!(
                "silent_renew_timeout_secs must be greater than 0 for {}",
                self.config_id
            )));
        }

        Ok(self)
    }
}
