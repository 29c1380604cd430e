//! OP session monitoring (OIDC Session Management)
//!
//! The OP's `check_session_iframe` is loaded into a hidden frame. Every
//! `check_session_interval_secs` the monitor posts `"<client_id> <session_state>"`
//! to it; the OP answers `unchanged`, `changed` or `error` through
//! [`SessionCheckMonitor::on_message`].
//!
//! More than `MAX_OUTSTANDING_SESSION_MESSAGES` unanswered heartbeats are
//! treated like `changed`: the OP is unreachable and the session can no longer
//! be vouched for. That notification fires once until an answer arrives or
//! the monitor is restarted.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use oidc_auth::{BoxFuture, MAX_OUTSTANDING_SESSION_MESSAGES};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::state::{OidcEvent, SessionChangeReason};

/// Hidden frame hosting the OP's check-session page.
pub trait SessionFrame: Send + Sync {
    /// (Re)load the frame at `url`.
    fn load<'a>(&'a self, url: &'a str) -> BoxFuture<'a, std::result::Result<(), String>>;

    /// Post `message` to the frame, restricted to `target_origin`.
    fn post_message<'a>(
        &'a self,
        message: &'a str,
        target_origin: &'a str,
    ) -> BoxFuture<'a, std::result::Result<(), String>>;
}

/// Message received from the check-session frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMessage {
    pub origin: String,
    pub data: String,
}

#[derive(Debug, Default)]
struct Heartbeat {
    outstanding: AtomicU32,
    reported: AtomicBool,
}

impl Heartbeat {
    fn reset(&self) {
        self.outstanding.store(0, Ordering::SeqCst);
        self.reported.store(false, Ordering::SeqCst);
    }
}

struct Running {
    cancel: CancellationToken,
    origin: String,
}

/// Check-session monitor for one configuration.
pub struct SessionCheckMonitor {
    orchestrator: Arc<Orchestrator>,
    frame: Arc<dyn SessionFrame>,
    heartbeat: Arc<Heartbeat>,
    running: Mutex<Option<Running>>,
}

fn origin_of(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).map_err(|e| {
        oidc_auth::Error::Metadata(format!("invalid check_session_iframe {url}: {e}"))
    })?;
    Ok(parsed.origin().ascii_serialization())
}

fn report_session_changed(orchestrator: &Orchestrator, reason: SessionChangeReason) {
    orchestrator.set_server_state_changed(true);
    metrics::counter!("oidc_session_changed_total", "reason" => reason.label()).increment(1);
    info!(
        config_id = orchestrator.config_id(),
        reason = reason.label(),
        "OP session changed"
    );
    orchestrator.publish(OidcEvent::SessionChanged(reason));
}

impl SessionCheckMonitor {
    pub fn new(orchestrator: Arc<Orchestrator>, frame: Arc<dyn SessionFrame>) -> Self {
        Self {
            orchestrator,
            frame,
            heartbeat: Arc::new(Heartbeat::default()),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Whether the OP session is known to have changed since the last login.
    pub fn server_state_changed(&self) -> bool {
        self.orchestrator.server_state_changed()
    }

    /// Load the frame and start the heartbeat. No-op if already running.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            debug!(config_id = self.orchestrator.config_id(), "session monitor already running");
            return Ok(());
        }

        let endpoint = self
            .orchestrator
            .metadata()
            .well_known()
            .await?
            .and_then(|w| w.check_session_iframe)
            .ok_or_else(|| {
                Error::MissingCheckSessionEndpoint(self.orchestrator.config_id().to_owned())
            })?;
        let origin = origin_of(&endpoint)?;

        let mut running = self.running();
        if running.is_some() {
            return Ok(());
        }
        self.heartbeat.reset();
        let cancel = CancellationToken::new();
        tokio::spawn(heartbeat_loop(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.frame),
            Arc::clone(&self.heartbeat),
            endpoint,
            origin.clone(),
            cancel.clone(),
        ));
        *running = Some(Running { cancel, origin });
        info!(config_id = self.orchestrator.config_id(), "session monitor started");
        Ok(())
    }

    /// Stop the heartbeat.
    pub fn stop(&self) {
        if let Some(running) = self.running().take() {
            running.cancel.cancel();
            self.heartbeat.reset();
            info!(config_id = self.orchestrator.config_id(), "session monitor stopped");
        }
    }

    /// Handle a message posted back by the check-session frame.
    pub fn on_message(&self, message: FrameMessage) {
        let expected = self.running().as_ref().map(|r| r.origin.clone());
        let config_id = self.orchestrator.config_id();
        match expected {
            Some(origin) if origin == message.origin => {}
            Some(_) => {
                debug!(config_id, origin = %message.origin, "ignoring message from foreign origin");
                return;
            }
            None => {
                debug!(config_id, "session monitor not running, ignoring message");
                return;
            }
        }

        match message.data.as_str() {
            "error" => {
                warn!(config_id, "check session frame reported an error");
                self.orchestrator
                    .publish(OidcEvent::CheckSessionReceived(message.data));
            }
            "changed" => {
                self.orchestrator
                    .publish(OidcEvent::CheckSessionReceived(message.data));
                report_session_changed(&self.orchestrator, SessionChangeReason::Changed);
            }
            _ => {
                self.heartbeat.reset();
                debug!(config_id, data = %message.data, "session unchanged");
                self.orchestrator
                    .publish(OidcEvent::CheckSessionReceived(message.data));
            }
        }
    }
}

impl Drop for SessionCheckMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.cancel.cancel();
        }
    }
}

async fn heartbeat_loop(
    orchestrator: Arc<Orchestrator>,
    frame: Arc<dyn SessionFrame>,
    heartbeat: Arc<Heartbeat>,
    endpoint: String,
    origin: String,
    cancel: CancellationToken,
) {
    let config = orchestrator.config();
    let reload_every = Duration::from_secs(config.check_session_reload_secs);
    let mut ticker = tokio::time::interval(Duration::from_secs(config.check_session_interval_secs));
    // Skip the immediate first tick, the frame is loaded first
    ticker.tick().await;
    let mut last_load: Option<Instant> = None;

    loop {
        if last_load.is_none_or(|loaded| loaded.elapsed() >= reload_every) {
            match frame.load(&endpoint).await {
                Ok(()) => {
                    debug!(config_id = orchestrator.config_id(), "check session frame loaded");
                    last_load = Some(Instant::now());
                }
                Err(e) => {
                    warn!(config_id = orchestrator.config_id(), error = %e, "check session frame failed to load");
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        send_heartbeat(&orchestrator, frame.as_ref(), &heartbeat, &origin).await;
    }
}

async fn send_heartbeat(
    orchestrator: &Orchestrator,
    frame: &dyn SessionFrame,
    heartbeat: &Heartbeat,
    origin: &str,
) {
    let config_id = orchestrator.config_id();
    let session_state = match orchestrator.store().load().await {
        Ok(state) => state.session_state,
        Err(e) => {
            warn!(config_id, error = %e, "failed to read session state");
            return;
        }
    };
    let Some(session_state) = session_state else {
        debug!(config_id, "session_state is blank, skipping heartbeat");
        return;
    };

    let message = format!("{} {session_state}", orchestrator.config().client_id);
    if let Err(e) = frame.post_message(&message, origin).await {
        warn!(config_id, error = %e, "failed to post check session message");
    }

    let outstanding = heartbeat.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
    if outstanding > MAX_OUTSTANDING_SESSION_MESSAGES && !heartbeat.reported.swap(true, Ordering::SeqCst) {
        error!(
            config_id,
            outstanding, "not receiving check session responses, OP unreachable"
        );
        report_session_changed(orchestrator, SessionChangeReason::Unreachable);
    }
}
