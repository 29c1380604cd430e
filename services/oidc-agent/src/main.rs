//! OIDC relying-party agent
//!
//! Single-binary loopback service that:
//! 1. Loads one or more client registrations from TOML
//! 2. Persists flow state to a JSON file
//! 3. Serves login / callback / logout / status / renew routes
//! 4. Keeps sessions alive with the periodic token check

mod config;
mod error;
mod metrics;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use oidc_auth::{DiscoveryMetadata, FileStorage, ReqwestTransport, Storage, Transport};
use oidc_session::{Orchestrator, Registry, Session};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AgentConfig;
use crate::routes::{AppState, build_router};

/// Upper bound on draining in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting oidc-agent");

    let prometheus = metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = AgentConfig::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = AgentConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        storage = %config.storage.path.display(),
        clients = config.clients.len(),
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.server.http_timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(http));
    let storage: Arc<dyn Storage> = Arc::new(
        FileStorage::load(config.storage.path.clone())
            .await
            .context("failed to open flow state storage")?,
    );

    let registry = Arc::new(Registry::new());
    for client in config.clients {
        if client.silent_renew && !client.use_refresh_token {
            warn!(
                config_id = %client.config_id,
                "iframe silent renew is unavailable in the agent, enable use_refresh_token"
            );
        }
        let metadata = Arc::new(DiscoveryMetadata::new(
            client.authority.clone(),
            Arc::clone(&transport),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            client,
            Arc::clone(&storage),
            Arc::clone(&transport),
            metadata,
        ));
        let session = Arc::new(Session::new(orchestrator, None, None));
        registry.add(Arc::clone(&session)).await;

        // Sessions persisted by a previous run resume their phase and expiry checks.
        session.orchestrator().check_auth(None).await?;
        if session.orchestrator().is_authenticated().await? {
            info!(config_id = session.config_id(), "resuming stored session");
            if let Err(e) = session.start_background().await {
                warn!(config_id = session.config_id(), error = %e, "background session tasks not started");
            }
        }
    }

    let app = build_router(
        AppState {
            registry: Arc::clone(&registry),
            prometheus,
        },
        config.server.max_connections,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    registry.shutdown().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
