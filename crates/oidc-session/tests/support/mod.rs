//! Fake OP for session tests: checks PKCE, mints RS256 id tokens and counts
//! token-endpoint calls.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use oidc_auth::{
    BoxFuture, MemoryStorage, OidcConfig, StaticMetadata, Storage, Transport, TransportError,
    WellKnownEndpoints, now_secs,
};
use oidc_session::{Orchestrator, SilentRenewFrame};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

pub const ISSUER: &str = "https://op.example.com";
pub const CLIENT_ID: &str = "spa";
pub const REDIRECT_URL: &str = "https://app.example.com/callback";
pub const SILENT_RENEW_URL: &str = "https://app.example.com/silent-renew";

const RSA_PEM: &[u8] = include_bytes!("../../../oidc-auth/tests/fixtures/rsa_signing_key.pem");
const RSA_N: &str = "m4aZFwG61AZLtucvLJ380pzkKLss2CmzvmkifAcXTmCvHebaLlERCU7exmyDFnvxQtZ-KwUEDCg8gnOQ4rOchISHCEGLPq1AbgqyuNadxUF_8V5FYBDJwXTkqUHdcAyfXD46u_EnlFxwV-ya2VVvQfaBWHV7oas6D95C-vFc_LxMGxo98xNaneW8EMHmN7xPHWcG8lnyPCqi3Z4cCSWNupRUTQTr_O2cnAGGlQ2JSXwzwApD4q2HV5oYgSlxzuq7hFyWf3PZOglp37AzWesR_kwRr0APo5IUHSjsAFEqXEq_KtGmqCnyuEZvdxWp6shiTkX1lw2tVd34JaSR_1pbkQ";

pub fn config() -> OidcConfig {
    let mut config = OidcConfig::new(ISSUER, CLIENT_ID, REDIRECT_URL);
    config.post_logout_redirect_uri = Some("https://app.example.com/".into());
    config
}

pub fn well_known() -> WellKnownEndpoints {
    WellKnownEndpoints {
        issuer: ISSUER.into(),
        authorization_endpoint: Some(format!("{ISSUER}/authorize")),
        token_endpoint: Some(format!("{ISSUER}/token")),
        userinfo_endpoint: Some(format!("{ISSUER}/userinfo")),
        end_session_endpoint: Some(format!("{ISSUER}/logout")),
        revocation_endpoint: Some(format!("{ISSUER}/revoke")),
        check_session_iframe: Some(format!("{ISSUER}/checksession")),
        ..Default::default()
    }
}

pub fn jwks() -> JwkSet {
    let key: Jwk = serde_json::from_value(json!({
        "kty": "RSA", "use": "sig", "alg": "RS256", "kid": "k1", "n": RSA_N, "e": "AQAB"
    }))
    .unwrap();
    JwkSet { keys: vec![key] }
}

fn at_hash(access_token: &str) -> String {
    let digest = Sha256::digest(access_token.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub fn id_token(nonce: Option<&str>, access_token: &str) -> String {
    let now = now_secs();
    let mut claims = json!({
        "iss": ISSUER,
        "sub": "alice",
        "aud": CLIENT_ID,
        "exp": now + 300,
        "iat": now,
        "at_hash": at_hash(access_token),
    });
    if let Some(nonce) = nonce {
        claims["nonce"] = json!(nonce);
    }
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("k1".into());
    encode(&header, &claims, &EncodingKey::from_rsa_pem(RSA_PEM).unwrap()).unwrap()
}

/// Query parameter of an authorization URL.
pub fn query_param(url: &str, key: &str) -> Option<String> {
    url::Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

#[derive(Debug, Default)]
pub struct OpState {
    pub challenge: Option<String>,
    pub nonce: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_calls: usize,
    pub refresh_calls: usize,
    pub revoked: Vec<(String, String)>,
    pub reject_refresh: bool,
    pub userinfo_sub: Option<String>,
}

/// In-memory OP behind the [`Transport`] seam.
#[derive(Default)]
pub struct FakeOp {
    pub state: Mutex<OpState>,
    pub refresh_delay: Duration,
}

impl FakeOp {
    pub fn with_refresh_delay(delay: Duration) -> Self {
        Self {
            refresh_delay: delay,
            ..Default::default()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OpState> {
        self.state.lock().unwrap()
    }

    /// The user agent reached the authorize endpoint with `url`; returns its `state`.
    pub fn authorize(&self, url: &str) -> String {
        let mut state = self.lock();
        state.challenge = query_param(url, "code_challenge");
        state.nonce = query_param(url, "nonce");
        state.redirect_uri = query_param(url, "redirect_uri");
        query_param(url, "state").unwrap()
    }

    pub fn code_calls(&self) -> usize {
        self.lock().code_calls
    }

    pub fn refresh_calls(&self) -> usize {
        self.lock().refresh_calls
    }

    fn token(&self, form: &[(String, String)]) -> Result<Value, TransportError> {
        let field = |key: &str| {
            form.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        let invalid_grant = || -> Result<Value, TransportError> {
            Err(TransportError::Status {
                status: 400,
                body: r#"{"error":"invalid_grant","error_description":"rejected"}"#.into(),
            })
        };
        let mut state = self.lock();

        match field("grant_type").as_deref() {
            Some("authorization_code") => {
                state.code_calls += 1;
                let verifier = field("code_verifier").unwrap_or_default();
                if state.challenge.as_deref() != Some(challenge_for(&verifier).as_str())
                    || field("redirect_uri") != state.redirect_uri
                {
                    return invalid_grant();
                }
                let access_token = format!("access-{}", state.code_calls);
                Ok(json!({
                    "access_token": access_token,
                    "id_token": id_token(state.nonce.as_deref(), &access_token),
                    "refresh_token": "refresh-1",
                    "expires_in": 300,
                    "token_type": "Bearer",
                }))
            }
            Some("refresh_token") => {
                state.refresh_calls += 1;
                if state.reject_refresh {
                    return invalid_grant();
                }
                let access_token = format!("refreshed-{}", state.refresh_calls);
                Ok(json!({
                    "access_token": access_token,
                    "id_token": id_token(None, &access_token),
                    "refresh_token": format!("refresh-{}", state.refresh_calls + 1),
                    "expires_in": 300,
                }))
            }
            _ => invalid_grant(),
        }
    }
}

impl Transport for FakeOp {
    fn get_json<'a>(
        &'a self,
        url: &'a str,
        bearer: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Value, TransportError>> {
        let response = if url == format!("{ISSUER}/userinfo") && bearer.is_some() {
            let sub = self.lock().userinfo_sub.clone().unwrap_or_else(|| "alice".into());
            Ok(json!({"sub": sub, "name": "Alice"}))
        } else {
            Err(TransportError::Status {
                status: 404,
                body: String::new(),
            })
        };
        Box::pin(async move { response })
    }

    fn post_form<'a>(
        &'a self,
        url: &'a str,
        form: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<Value, TransportError>> {
        Box::pin(async move {
            if url == format!("{ISSUER}/revoke") {
                let field = |key: &str| {
                    form.iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, v)| v.clone())
                        .unwrap_or_default()
                };
                self.lock()
                    .revoked
                    .push((field("token_type_hint"), field("token")));
                return Ok(Value::Null);
            }
            let is_refresh = form
                .iter()
                .any(|(k, v)| k == "grant_type" && v == "refresh_token");
            let response = self.token(form);
            if is_refresh && !self.refresh_delay.is_zero() {
                tokio::time::sleep(self.refresh_delay).await;
            }
            response
        })
    }
}

/// Silent-renew frame that lets the fake OP answer `prompt=none` immediately.
pub struct OpFrame {
    pub op: Arc<FakeOp>,
}

impl SilentRenewFrame for OpFrame {
    fn navigate<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, String>> {
        let state = self.op.authorize(url);
        let redirect = query_param(url, "redirect_uri").unwrap_or_default();
        Box::pin(async move { Ok(format!("{redirect}?code=silent-code&state={state}&session_state=s2")) })
    }
}

/// Frame whose navigation never completes.
pub struct StuckFrame;

impl SilentRenewFrame for StuckFrame {
    fn navigate<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(std::future::pending())
    }
}

pub fn orchestrator(
    config: OidcConfig,
    op: Arc<FakeOp>,
    storage: Arc<dyn Storage>,
) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        config,
        storage,
        op,
        Arc::new(StaticMetadata::new(Some(well_known()), jwks())),
    ))
}

pub fn memory() -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::new())
}

/// Run the code flow to completion.
pub async fn login(orchestrator: &Orchestrator, op: &FakeOp) {
    let url = orchestrator.authorize(&[]).await.unwrap();
    let state = op.authorize(&url);
    let outcome = orchestrator
        .check_auth(Some(&format!("{REDIRECT_URL}?code=abc&state={state}&session_state=s1")))
        .await
        .unwrap();
    assert!(outcome.is_authenticated, "login failed: {outcome:?}");
}
