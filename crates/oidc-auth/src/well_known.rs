//! OP metadata: well-known endpoints and signing keys
//!
//! The engine only consumes metadata through [`MetadataSource`]. Two
//! implementations ship here: [`StaticMetadata`] for callers that already
//! hold the documents, and [`DiscoveryMetadata`] which fetches them through
//! the transport collaborator.

use std::sync::Arc;

use jsonwebtoken::jwk::JwkSet;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::WELL_KNOWN_SUFFIX;
use crate::error::{Error, Result};
use crate::transport::{BoxFuture, Transport};

/// Endpoint set from the OP's discovery document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WellKnownEndpoints {
    pub issuer: String,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub check_session_iframe: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub introspection_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

impl WellKnownEndpoints {
    /// Endpoint or a descriptive metadata error.
    pub fn require<'a>(&self, endpoint: Option<&'a str>, name: &str) -> Result<&'a str> {
        endpoint.ok_or_else(|| Error::Metadata(format!("{name} not advertised by {}", self.issuer)))
    }
}

/// Supplies well-known endpoints and the signing key set for one configuration.
pub trait MetadataSource: Send + Sync {
    /// Endpoint set, or `None` when none has been supplied.
    fn well_known(&self) -> BoxFuture<'_, Result<Option<WellKnownEndpoints>>>;

    /// Current signing keys.
    fn jwks(&self) -> BoxFuture<'_, Result<JwkSet>>;
}

/// Metadata handed to the engine up front.
#[derive(Debug, Clone)]
pub struct StaticMetadata {
    well_known: Option<WellKnownEndpoints>,
    jwks: JwkSet,
}

impl StaticMetadata {
    pub fn new(well_known: Option<WellKnownEndpoints>, jwks: JwkSet) -> Self {
        Self { well_known, jwks }
    }
}

impl MetadataSource for StaticMetadata {
    fn well_known(&self) -> BoxFuture<'_, Result<Option<WellKnownEndpoints>>> {
        let endpoints = self.well_known.clone();
        Box::pin(async move { Ok(endpoints) })
    }

    fn jwks(&self) -> BoxFuture<'_, Result<JwkSet>> {
        let jwks = self.jwks.clone();
        Box::pin(async move { Ok(jwks) })
    }
}

/// Metadata fetched from `{authority}/.well-known/openid-configuration`.
///
/// The discovery document is cached after the first successful fetch. The
/// key set is fetched on every call so rotated keys are picked up at the
/// next callback.
pub struct DiscoveryMetadata {
    authority: String,
    transport: Arc<dyn Transport>,
    cached: Mutex<Option<WellKnownEndpoints>>,
}

impl DiscoveryMetadata {
    pub fn new(authority: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            authority: authority.into(),
            transport,
            cached: Mutex::new(None),
        }
    }

    fn discovery_url(&self) -> String {
        format!("{}{WELL_KNOWN_SUFFIX}", self.authority.trim_end_matches('/'))
    }

    async fn load(&self) -> Result<WellKnownEndpoints> {
        let mut cached = self.cached.lock().await;
        if let Some(endpoints) = cached.as_ref() {
            return Ok(endpoints.clone());
        }

        let url = self.discovery_url();
        let document = self.transport.get_json(&url, None).await?;
        let endpoints: WellKnownEndpoints = serde_json::from_value(document)
            .map_err(|e| Error::Metadata(format!("invalid discovery document at {url}: {e}")))?;
        info!(issuer = %endpoints.issuer, "loaded discovery document");
        *cached = Some(endpoints.clone());
        Ok(endpoints)
    }
}

impl MetadataSource for DiscoveryMetadata {
    fn well_known(&self) -> BoxFuture<'_, Result<Option<WellKnownEndpoints>>> {
        Box::pin(async move { self.load().await.map(Some) })
    }

    fn jwks(&self) -> BoxFuture<'_, Result<JwkSet>> {
        Box::pin(async move {
            let endpoints = self.load().await?;
            let jwks_uri = endpoints.require(endpoints.jwks_uri.as_deref(), "jwks_uri")?;
            let document = self.transport.get_json(jwks_uri, None).await?;
            let jwks: JwkSet = serde_json::from_value(document)
                .map_err(|e| Error::Metadata(format!("invalid key set at {jwks_uri}: {e}")))?;
            debug!(keys = jwks.keys.len(), "fetched signing keys");
            Ok(jwks)
        })
    }
}
