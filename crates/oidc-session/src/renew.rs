//! Silent renewal
//!
//! [`RenewCoordinator`] renews a session without user interaction, either
//! with the refresh-token grant or by loading a `prompt=none` authorization
//! URL in a hidden frame. At most one renewal runs per configuration:
//!
//! - within this process, concurrent triggers share one in-flight future;
//! - across processes sharing storage, the persisted renewal flag is claimed
//!   first and a fresh flag owned by someone else fails the trigger.
//!
//! Both the persisted flag and the in-process slot are cleared by the
//! renewal task itself when the attempt ends, whatever the outcome, so a
//! cancelled caller cannot leave either set.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::Shared;
use oidc_auth::{BoxFuture, now_secs};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::orchestrator::{AuthOutcome, Orchestrator};
use crate::state::OidcEvent;

/// Hidden frame used for `prompt=none` renewals.
pub trait SilentRenewFrame: Send + Sync {
    /// Load `url` and resolve with the URL the OP finally redirected the frame to.
    fn navigate<'a>(&'a self, url: &'a str) -> BoxFuture<'a, std::result::Result<String, String>>;
}

type SharedRenewal = Shared<BoxFuture<'static, Result<AuthOutcome>>>;

/// Empties the in-flight slot when the renewal task ends or is dropped.
struct ReleaseSlot(Arc<RenewCoordinator>);

impl Drop for ReleaseSlot {
    fn drop(&mut self) {
        *self.0.in_flight.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

/// Single-flight silent renewal for one configuration.
pub struct RenewCoordinator {
    orchestrator: Arc<Orchestrator>,
    frame: Option<Arc<dyn SilentRenewFrame>>,
    in_flight: Mutex<Option<SharedRenewal>>,
}

impl RenewCoordinator {
    pub fn new(orchestrator: Arc<Orchestrator>, frame: Option<Arc<dyn SilentRenewFrame>>) -> Self {
        Self {
            orchestrator,
            frame,
            in_flight: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Whether this process currently has a renewal in flight.
    pub fn is_running(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|renewal| renewal.peek().is_none())
    }

    /// Start a renewal, or join the one already in flight.
    pub async fn trigger_renewal(
        self: &Arc<Self>,
        custom_params: Vec<(String, String)>,
    ) -> Result<AuthOutcome> {
        let renewal = {
            let mut guard = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            match guard.as_ref() {
                Some(renewal) if renewal.peek().is_none() => {
                    debug!(
                        config_id = self.orchestrator.config_id(),
                        "joining in-flight silent renew"
                    );
                    renewal.clone()
                }
                _ => {
                    // the slot is released by the task, never by a waiter
                    let coordinator = Arc::clone(self);
                    let handle = tokio::spawn(async move {
                        let _release = ReleaseSlot(Arc::clone(&coordinator));
                        coordinator.run(custom_params).await
                    });
                    let renewal: BoxFuture<'static, Result<AuthOutcome>> = Box::pin(async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(Error::RenewAborted(e.to_string())))
                    });
                    let renewal = renewal.shared();
                    *guard = Some(renewal.clone());
                    renewal
                }
            }
        };
        renewal.await
    }

    async fn run(self: Arc<Self>, custom_params: Vec<(String, String)>) -> Result<AuthOutcome> {
        let orchestrator = &self.orchestrator;
        let config_id = orchestrator.config_id().to_owned();
        let timeout_secs = orchestrator.config().silent_renew_timeout_secs;

        if !orchestrator
            .store()
            .try_start_silent_renew(now_secs(), timeout_secs)
            .await?
        {
            debug!(config_id = %config_id, "silent renew flag held elsewhere");
            return Err(Error::RenewAlreadyRunning(config_id));
        }

        orchestrator.publish(OidcEvent::SilentRenewStarted);
        info!(config_id = %config_id, "silent renew started");

        let result = self.renew_once(&custom_params).await;

        if let Err(e) = orchestrator.store().finish_silent_renew().await {
            warn!(config_id = %config_id, error = %e, "failed to clear silent renew flag");
        }

        let outcome = match &result {
            Ok(outcome) if outcome.is_authenticated => "success",
            Ok(outcome) => {
                orchestrator.publish(OidcEvent::SilentRenewFailed(
                    outcome.validation_result.label().to_owned(),
                ));
                "rejected"
            }
            Err(e) => {
                orchestrator.publish(OidcEvent::SilentRenewFailed(e.to_string()));
                "error"
            }
        };
        metrics::counter!("oidc_renewals_total", "outcome" => outcome).increment(1);
        info!(config_id = %config_id, outcome, "silent renew finished");
        result
    }

    async fn renew_once(&self, custom_params: &[(String, String)]) -> Result<AuthOutcome> {
        let orchestrator = &self.orchestrator;
        let config = orchestrator.config();

        if config.use_refresh_token {
            return orchestrator
                .refresh_session_with_refresh_token(custom_params)
                .await;
        }

        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| Error::NoSilentRenewFrame(config.config_id.clone()))?;
        let url = orchestrator.silent_authorize_url(custom_params).await?;
        let callback = tokio::time::timeout(
            Duration::from_secs(config.silent_renew_timeout_secs),
            frame.navigate(&url),
        )
        .await
        .map_err(|_| Error::RenewTimeout(config.silent_renew_timeout_secs))?
        .map_err(Error::SilentRenewFrame)?;

        orchestrator.check_auth_renew(&callback).await
    }
}
