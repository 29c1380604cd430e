//! Test helpers: token minting from the PEM fixtures and a scripted transport.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};

use crate::transport::{BoxFuture, Transport, TransportError};

const RSA_PEM: &[u8] = include_bytes!("../tests/fixtures/rsa_signing_key.pem");
const RSA_FOREIGN_PEM: &[u8] = include_bytes!("../tests/fixtures/rsa_foreign_key.pem");
const EC_PEM: &[u8] = include_bytes!("../tests/fixtures/ec_signing_key.pem");

const RSA_N: &str = "m4aZFwG61AZLtucvLJ380pzkKLss2CmzvmkifAcXTmCvHebaLlERCU7exmyDFnvxQtZ-KwUEDCg8gnOQ4rOchISHCEGLPq1AbgqyuNadxUF_8V5FYBDJwXTkqUHdcAyfXD46u_EnlFxwV-ya2VVvQfaBWHV7oas6D95C-vFc_LxMGxo98xNaneW8EMHmN7xPHWcG8lnyPCqi3Z4cCSWNupRUTQTr_O2cnAGGlQ2JSXwzwApD4q2HV5oYgSlxzuq7hFyWf3PZOglp37AzWesR_kwRr0APo5IUHSjsAFEqXEq_KtGmqCnyuEZvdxWp6shiTkX1lw2tVd34JaSR_1pbkQ";
const RSA_FOREIGN_N: &str = "u6ugkPN2uUPnd2VE7BoRcU-DRU2E2ogQ6rjsQsVhSJO0iq-r_JPKSQGTcEMEZytdoPLg0iVSFVDgCXgyDcLkgk_cu0kaRzNfUmjE3WuXsi7vp7SXS5sRrFzf0d3OWZCqV3b7sr0sF7weGnLwLnp0dkZJwA7MTg7jtx9YGzbCX1Sosm0VSoTTzbyEDCEB81kbQn5g1suTK8nv3msrf6nErgToyLQn-Pt2j2M4FjP7NJjvEVHuLcMOEn0lR7Y6JjZBjgbKO80XtrAb6EQmmO2Yz9vv_orHoM5Hvj_ytqAsO3H1tNZrzJbIgqypnRR9pVMIahTFGBXHkSRcFpvF1ntcNQ";
const EC_X: &str = "KH007MO9ZEma8PHtRo6CD4h3E5qNSh9kQe4TBAac0Tw";
const EC_Y: &str = "hJNTP8LUp6HMxwhH6R49xayEG0lmpvWPXtiaPTMrKYQ";

fn rsa_public(n: &str, kid: Option<&str>) -> Jwk {
    let mut value = json!({"kty": "RSA", "use": "sig", "alg": "RS256", "n": n, "e": "AQAB"});
    if let Some(kid) = kid {
        value["kid"] = json!(kid);
    }
    serde_json::from_value(value).unwrap()
}

pub fn rsa_jwk(kid: Option<&str>) -> Jwk {
    rsa_public(RSA_N, kid)
}

pub fn foreign_rsa_jwk(kid: Option<&str>) -> Jwk {
    rsa_public(RSA_FOREIGN_N, kid)
}

pub fn ec_jwk(kid: Option<&str>) -> Jwk {
    let mut value = json!({"kty": "EC", "use": "sig", "crv": "P-256", "x": EC_X, "y": EC_Y});
    if let Some(kid) = kid {
        value["kid"] = json!(kid);
    }
    serde_json::from_value(value).unwrap()
}

pub fn jwks(keys: Vec<Jwk>) -> JwkSet {
    JwkSet { keys }
}

fn sign(alg: Algorithm, key: &EncodingKey, claims: &Value, kid: Option<&str>) -> String {
    let mut header = Header::new(alg);
    header.kid = kid.map(str::to_owned);
    encode(&header, claims, key).unwrap()
}

pub fn sign_rsa(claims: &Value, kid: Option<&str>) -> String {
    sign(Algorithm::RS256, &EncodingKey::from_rsa_pem(RSA_PEM).unwrap(), claims, kid)
}

pub fn sign_rsa_foreign(claims: &Value, kid: Option<&str>) -> String {
    sign(Algorithm::RS256, &EncodingKey::from_rsa_pem(RSA_FOREIGN_PEM).unwrap(), claims, kid)
}

pub fn sign_ec(claims: &Value, kid: Option<&str>) -> String {
    sign(Algorithm::ES256, &EncodingKey::from_ec_pem(EC_PEM).unwrap(), claims, kid)
}

pub fn encode_segment(value: &Value) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).unwrap())
}

/// Transport returning queued responses in order and recording every call.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<Value, TransportError>>>,
    pub calls: std::sync::Mutex<Vec<RecordedCall>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub url: String,
    pub bearer: Option<String>,
    pub form: Vec<(String, String)>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<Value, TransportError>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn respond(&self, call: RecordedCall) -> Result<Value, TransportError> {
        self.calls.lock().unwrap().push(call);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("no scripted response".into())))
    }
}

impl Transport for ScriptedTransport {
    fn get_json<'a>(
        &'a self,
        url: &'a str,
        bearer: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Value, TransportError>> {
        let response = self.respond(RecordedCall {
            url: url.to_owned(),
            bearer: bearer.map(str::to_owned),
            form: Vec::new(),
        });
        Box::pin(async move { response })
    }

    fn post_form<'a>(
        &'a self,
        url: &'a str,
        form: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<Value, TransportError>> {
        let response = self.respond(RecordedCall {
            url: url.to_owned(),
            bearer: None,
            form: form.to_vec(),
        });
        Box::pin(async move { response })
    }
}

/// Value of a form field in a recorded call.
pub fn form_value<'a>(call: &'a RecordedCall, key: &str) -> Option<&'a str> {
    call.form
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
