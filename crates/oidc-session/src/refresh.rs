//! Periodic token expiry check
//!
//! Spawns a task that checks the session's tokens every
//! `token_refresh_interval_secs` and triggers a silent renewal once the access
//! token or id token expires within `renew_time_before_token_expires_secs`.
//! Without silent renewal an expired session is logged off locally.

use std::sync::Arc;
use std::time::Duration;

use oidc_auth::now_secs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::renew::RenewCoordinator;
use crate::state::OidcEvent;

/// Spawn the expiry check for one configuration. Runs until `cancel` fires.
pub fn spawn_token_check_task(
    renew: Arc<RenewCoordinator>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(renew.orchestrator().config().token_refresh_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; a login or restore just happened
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            token_check_cycle(&renew).await;
        }
        debug!(config_id = renew.orchestrator().config_id(), "token check task stopped");
    })
}

/// One check: renew (or log off) if a token is about to expire.
pub async fn token_check_cycle(renew: &Arc<RenewCoordinator>) {
    let orchestrator = renew.orchestrator();
    let config = orchestrator.config();
    let config_id = orchestrator.config_id();
    let now = now_secs();

    let state = match orchestrator.store().load().await {
        Ok(state) => state,
        Err(e) => {
            warn!(config_id, error = %e, "token check could not read flow state");
            return;
        }
    };
    if state.tokens.is_empty() {
        return;
    }
    if renew.is_running() || state.silent_renew_running(now, config.silent_renew_timeout_secs) {
        debug!(config_id, "silent renew in progress, skipping token check");
        return;
    }

    let expiry = crate::orchestrator::token_expiry(
        &state.tokens,
        now,
        config.renew_time_before_token_expires_secs,
    );
    if !expiry.any() {
        return;
    }
    if expiry.access_token {
        orchestrator.publish(OidcEvent::TokenExpired);
    }
    if expiry.id_token {
        orchestrator.publish(OidcEvent::IdTokenExpired);
    }

    if !config.silent_renew {
        info!(config_id, "tokens expired and silent renew is off, logging off locally");
        if let Err(e) = orchestrator.logoff_local().await {
            warn!(config_id, error = %e, "local logoff after expiry failed");
        }
        return;
    }

    debug!(
        config_id,
        access_token = expiry.access_token,
        id_token = expiry.id_token,
        "tokens expiring, triggering silent renew"
    );
    match renew.trigger_renewal(Vec::new()).await {
        Ok(outcome) if outcome.is_authenticated => {
            info!(config_id, "tokens renewed before expiry");
        }
        Ok(outcome) => {
            warn!(
                config_id,
                result = outcome.validation_result.label(),
                "silent renew rejected"
            );
        }
        Err(e) => {
            warn!(config_id, error = %e, "silent renew failed, will retry next cycle");
        }
    }
}
