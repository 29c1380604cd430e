//! Per-configuration sessions and the registry that holds them
//!
//! A [`Session`] bundles the orchestrator of one configuration with its
//! renewal coordinator, optional session monitor and background expiry check.
//! The [`Registry`] keys sessions by `config_id`; configurations never share
//! flow state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::check_session::{SessionCheckMonitor, SessionFrame};
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::refresh::spawn_token_check_task;
use crate::renew::{RenewCoordinator, SilentRenewFrame};
use crate::state::FlowPhase;

/// Everything running for one configuration.
pub struct Session {
    orchestrator: Arc<Orchestrator>,
    renew: Arc<RenewCoordinator>,
    monitor: Option<SessionCheckMonitor>,
    background: CancellationToken,
    token_check_started: AtomicBool,
}

impl Session {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        renew_frame: Option<Arc<dyn SilentRenewFrame>>,
        session_frame: Option<Arc<dyn SessionFrame>>,
    ) -> Self {
        let renew = Arc::new(RenewCoordinator::new(Arc::clone(&orchestrator), renew_frame));
        let monitor = session_frame.map(|frame| SessionCheckMonitor::new(Arc::clone(&orchestrator), frame));
        Self {
            orchestrator,
            renew,
            monitor,
            background: CancellationToken::new(),
            token_check_started: AtomicBool::new(false),
        }
    }

    pub fn config_id(&self) -> &str {
        self.orchestrator.config_id()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn renew(&self) -> &Arc<RenewCoordinator> {
        &self.renew
    }

    pub fn monitor(&self) -> Option<&SessionCheckMonitor> {
        self.monitor.as_ref()
    }

    /// Start the expiry check and, when configured, the session monitor.
    /// Safe to call after every login.
    pub async fn start_background(&self) -> Result<()> {
        if !self.token_check_started.swap(true, Ordering::SeqCst) {
            spawn_token_check_task(Arc::clone(&self.renew), self.background.child_token());
        }
        if self.orchestrator.config().start_check_session {
            match &self.monitor {
                Some(monitor) => monitor.start().await?,
                None => warn!(
                    config_id = self.config_id(),
                    "start_check_session is set but no session frame is available"
                ),
            }
        }
        Ok(())
    }

    /// Log off, stopping the session monitor first.
    pub async fn logoff(&self, custom_params: &[(String, String)]) -> Result<Option<String>> {
        let url = self.orchestrator.logoff(custom_params).await;
        self.stop_monitor();
        url
    }

    /// Revoke both tokens at the OP, then log off.
    pub async fn logoff_and_revoke_tokens(
        &self,
        custom_params: &[(String, String)],
    ) -> Result<Option<String>> {
        let url = self.orchestrator.logoff_and_revoke_tokens(custom_params).await?;
        self.stop_monitor();
        Ok(url)
    }

    fn stop_monitor(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
    }

    /// Stop all background work.
    pub fn shutdown(&self) {
        self.background.cancel();
        self.stop_monitor();
    }
}

/// Sessions keyed by configuration id, in registration order.
#[derive(Default)]
pub struct Registry {
    config_ids: RwLock<Vec<String>>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Returns `false` if its configuration id is taken.
    pub async fn add(&self, session: Arc<Session>) -> bool {
        let id = session.config_id().to_owned();
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            warn!(config_id = %id, "configuration already registered");
            return false;
        }
        sessions.insert(id.clone(), session);
        self.config_ids.write().await.push(id.clone());
        info!(config_id = %id, "session registered");
        true
    }

    /// Remove a session and stop its background work.
    pub async fn remove(&self, config_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(config_id)?;
        self.config_ids.write().await.retain(|id| id != config_id);
        session.shutdown();
        info!(config_id, "session removed");
        Some(session)
    }

    pub async fn get(&self, config_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(config_id)
            .cloned()
            .ok_or_else(|| Error::UnknownConfig(config_id.to_owned()))
    }

    pub async fn config_ids(&self) -> Vec<String> {
        self.config_ids.read().await.clone()
    }

    /// Stop background work of every session.
    pub async fn shutdown(&self) {
        for session in self.sessions.read().await.values() {
            session.shutdown();
        }
    }

    /// Health summary for the health endpoint.
    ///
    /// Status mapping: no session in an error phase → healthy, some → degraded,
    /// all (or no sessions at all) → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let ids = self.config_ids().await;
        let sessions = self.sessions.read().await;

        let mut entries = Vec::new();
        let mut authenticated_count = 0usize;
        let mut error_count = 0usize;

        for id in &ids {
            let Some(session) = sessions.get(id) else {
                continue;
            };
            let phase = session.orchestrator.phase();
            let authenticated = match session.orchestrator.is_authenticated().await {
                Ok(authenticated) => authenticated,
                Err(e) => {
                    warn!(config_id = %id, error = %e, "health check could not read flow state");
                    false
                }
            };
            if authenticated {
                authenticated_count += 1;
            }
            let mut entry = serde_json::json!({
                "config_id": id,
                "phase": phase.label(),
                "authenticated": authenticated,
                "silent_renew_running": session.renew.is_running(),
                "check_session_running": session.monitor.as_ref().is_some_and(SessionCheckMonitor::is_running),
            });
            if let FlowPhase::Error(result) = phase {
                error_count += 1;
                entry["last_error"] = serde_json::json!(result.label());
            }
            entries.push(entry);
        }

        let total = entries.len();
        let status = if total > 0 && error_count == 0 {
            "healthy"
        } else if error_count < total {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "sessions_total": total,
            "sessions_authenticated": authenticated_count,
            "sessions_failed": error_count,
            "sessions": entries,
        })
    }
}
