//! Agent HTTP routes
//!
//! Bound to a loopback address; the browser is sent through the OP and back
//! to `/callback/{id}`. Tokens are never returned by any route.
//!
//! Endpoints:
//! - GET  /login/{id}     redirect to the OP authorize endpoint (extra query
//!                        parameters are forwarded to the authorize request)
//! - GET  /callback/{id}  process the OP redirect
//! - POST /logout/{id}    local logoff, returns the end-session URL
//!                        (`?revoke=true` revokes both tokens first)
//! - GET  /status/{id}    session summary
//! - POST /renew/{id}     renew now (joins an in-flight renewal)
//! - GET  /health         registry health
//! - GET  /metrics        Prometheus exposition

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{MatchedPath, Path, Query, RawQuery, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use oidc_auth::now_secs;
use oidc_session::{AuthOutcome, Registry};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{Instrument, info, info_span, warn};

use crate::error::Result;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub prometheus: PrometheusHandle,
}

/// Build the router. `max_connections` bounds concurrent requests.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/login/{id}", get(login))
        .route("/callback/{id}", get(callback))
        .route("/logout/{id}", post(logout))
        .route("/status/{id}", get(status))
        .route("/renew/{id}", post(renew))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn(track_request))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Tag each request with an id, and record its route, status and latency.
async fn track_request(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let span = info_span!("request", %request_id, %route, method = %request.method());

    let start = Instant::now();
    let mut response = next.run(request).instrument(span).await;
    crate::metrics::record_request(
        &route,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn outcome_response(config_id: &str, outcome: &AuthOutcome) -> Response {
    let status = if outcome.is_authenticated {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    };
    json_response(
        status,
        json!({
            "config_id": config_id,
            "authenticated": outcome.is_authenticated,
            "validation_result": outcome.validation_result.label(),
            "error": outcome.error_message,
            "renew": outcome.is_renew_process,
            "redirect_to": outcome.redirect_to,
        }),
    )
}

/// GET /login/{id}: start the configured flow.
async fn login(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(custom_params): Query<Vec<(String, String)>>,
) -> Result<Response> {
    let session = state.registry.get(&id).await?;
    let url = session.orchestrator().authorize(&custom_params).await?;
    info!(config_id = %id, "redirecting to authorize endpoint");
    Ok(Redirect::to(&url).into_response())
}

/// GET /callback/{id}: validate the OP redirect and commit tokens.
///
/// The callback URL is rebuilt from the configured `redirect_url` so the
/// flow sees exactly what the OP redirected to.
async fn callback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response> {
    let session = state.registry.get(&id).await?;
    let orchestrator = session.orchestrator();
    let callback_url = query
        .filter(|q| !q.is_empty())
        .map(|q| format!("{}?{q}", orchestrator.config().redirect_url));

    let outcome = orchestrator.check_auth(callback_url.as_deref()).await?;
    if outcome.is_authenticated
        && let Err(e) = session.start_background().await
    {
        warn!(config_id = %id, error = %e, "background session tasks not started");
    }
    Ok(outcome_response(&id, &outcome))
}

#[derive(Debug, Default, Deserialize)]
struct LogoutParams {
    #[serde(default)]
    revoke: bool,
}

/// POST /logout/{id}: drop local state; the caller follows `end_session_url`.
async fn logout(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LogoutParams>,
) -> Result<Response> {
    let session = state.registry.get(&id).await?;
    let url = if params.revoke {
        session.logoff_and_revoke_tokens(&[]).await?
    } else {
        session.logoff(&[]).await?
    };
    Ok(json_response(
        StatusCode::OK,
        json!({ "config_id": id, "end_session_url": url }),
    ))
}

/// GET /status/{id}: session summary without tokens.
async fn status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let session = state.registry.get(&id).await?;
    let orchestrator = session.orchestrator();
    let expiry = orchestrator.token_expiry(now_secs(), 0).await?;

    Ok(json_response(
        StatusCode::OK,
        json!({
            "config_id": id,
            "phase": orchestrator.phase().label(),
            "authenticated": orchestrator.is_authenticated().await?,
            "access_token_expired": expiry.access_token,
            "id_token_expired": expiry.id_token,
            "user_data": orchestrator.user_data().await?,
            "silent_renew_running": session.renew().is_running(),
            "server_state_changed": orchestrator.server_state_changed(),
        }),
    ))
}

/// POST /renew/{id}: renew now.
async fn renew(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let session = state.registry.get(&id).await?;
    let outcome = session.renew().trigger_renewal(Vec::new()).await?;
    Ok(outcome_response(&id, &outcome))
}

/// GET /health: 200 unless every session failed (or none is registered).
async fn health(State(state): State<AppState>) -> Response {
    let body = state.registry.health().await;
    let status = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    json_response(status, body)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use oidc_auth::{
        BoxFuture, JwkSet, MemoryStorage, OidcConfig, StaticMetadata, Transport, TransportError,
        WellKnownEndpoints,
    };
    use oidc_session::{Orchestrator, Session};
    use tower::ServiceExt;

    const ISSUER: &str = "https://op.example.com";

    /// Transport for routes that must not reach the OP.
    struct OfflineTransport;

    impl Transport for OfflineTransport {
        fn get_json<'a>(
            &'a self,
            url: &'a str,
            _bearer: Option<&'a str>,
        ) -> BoxFuture<'a, std::result::Result<Value, TransportError>> {
            Box::pin(async move { Err(TransportError::Network(format!("offline: GET {url}"))) })
        }

        fn post_form<'a>(
            &'a self,
            url: &'a str,
            _form: &'a [(String, String)],
        ) -> BoxFuture<'a, std::result::Result<Value, TransportError>> {
            Box::pin(async move { Err(TransportError::Network(format!("offline: POST {url}"))) })
        }
    }

    fn session(config_id: &str, use_refresh_token: bool) -> Arc<Session> {
        let mut config = OidcConfig::new(
            ISSUER,
            "spa",
            format!("http://127.0.0.1:8400/callback/{config_id}"),
        );
        config.config_id = config_id.into();
        config.use_refresh_token = use_refresh_token;
        config.post_logout_redirect_uri = Some("http://127.0.0.1:8400/".into());

        let well_known = WellKnownEndpoints {
            issuer: ISSUER.into(),
            authorization_endpoint: Some(format!("{ISSUER}/authorize")),
            token_endpoint: Some(format!("{ISSUER}/token")),
            end_session_endpoint: Some(format!("{ISSUER}/logout")),
            ..Default::default()
        };
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(OfflineTransport),
            Arc::new(StaticMetadata::new(Some(well_known), JwkSet { keys: vec![] })),
        ));
        Arc::new(Session::new(orchestrator, None, None))
    }

    async fn app(sessions: Vec<Arc<Session>>) -> Router {
        let registry = Arc::new(Registry::new());
        for session in sessions {
            registry.add(session).await;
        }
        let (_recorder, prometheus) = crate::metrics::isolated_recorder();
        build_router(
            AppState {
                registry,
                prometheus,
            },
            16,
        )
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Response) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        (response.status(), response)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn login_redirects_to_authorize_endpoint() {
        let app = app(vec![session("spa", false)]).await;
        let (status, response) = send(app, "GET", "/login/spa?ui_locales=de").await;

        assert_eq!(status, StatusCode::SEE_OTHER);
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.starts_with(&format!("{ISSUER}/authorize?")), "{location}");
        assert!(location.contains("client_id=spa"));
        assert!(location.contains("code_challenge_method=S256"));
        assert!(location.contains("ui_locales=de"));
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn unknown_config_is_not_found() {
        let app = app(vec![session("spa", false)]).await;
        let (status, response) = send(app, "GET", "/status/nope").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "unknown configuration: nope");
    }

    #[tokio::test]
    async fn forged_callback_is_unauthorized() {
        let app = app(vec![session("spa", false)]).await;
        let (status, response) =
            send(app, "GET", "/callback/spa?code=abc&state=forged").await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["authenticated"], false);
        assert_eq!(body["validation_result"], "states_do_not_match");
        assert_eq!(body["redirect_to"], "/unauthorized");
    }

    #[tokio::test]
    async fn op_error_callback_reports_login_required() {
        let app = app(vec![session("spa", false)]).await;
        let (_, response) = send(app.clone(), "GET", "/login/spa").await;
        let location = response.headers()["location"].to_str().unwrap();
        let state = url::Url::parse(location)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let (status, response) = send(
            app,
            "GET",
            &format!("/callback/spa?error=login_required&error_description=no%20session&state={state}"),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["validation_result"], "login_required");
    }

    #[tokio::test]
    async fn unsolicited_error_callback_is_ignored() {
        let app = app(vec![session("spa", false)]).await;
        let (status, response) =
            send(app.clone(), "GET", "/callback/spa?error=login_required&state=forged").await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["validation_result"], "states_do_not_match");

        let (_, response) = send(app, "GET", "/status/spa").await;
        assert_eq!(body_json(response).await["phase"], "idle");
    }

    #[tokio::test]
    async fn status_of_fresh_session() {
        let app = app(vec![session("spa", false)]).await;
        let (status, response) = send(app, "GET", "/status/spa").await;

        assert_eq!(status, StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["phase"], "idle");
        assert_eq!(body["authenticated"], false);
        assert_eq!(body["user_data"], Value::Null);
        assert_eq!(body["silent_renew_running"], false);
    }

    #[tokio::test]
    async fn renew_without_refresh_token_is_unauthorized() {
        let app = app(vec![session("spa", true)]).await;
        let (status, response) = send(app, "POST", "/renew/spa").await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await["error"],
            "no refresh token found, please login"
        );
    }

    #[tokio::test]
    async fn logout_returns_end_session_url() {
        let app = app(vec![session("spa", false)]).await;
        let (status, response) = send(app, "POST", "/logout/spa").await;

        assert_eq!(status, StatusCode::OK);
        let url = body_json(response).await["end_session_url"]
            .as_str()
            .unwrap()
            .to_owned();
        assert!(url.starts_with(&format!("{ISSUER}/logout?")), "{url}");
        assert!(url.contains("post_logout_redirect_uri="));
    }

    #[tokio::test]
    async fn logout_with_revoke_needs_revocation_endpoint() {
        let app = app(vec![session("spa", false)]).await;
        let (status, _) = send(app, "POST", "/logout/spa?revoke=true").await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn health_reflects_registry() {
        let (status, response) = send(app(vec![]).await, "GET", "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["status"], "unhealthy");

        let app = app(vec![session("spa", false), session("admin", false)]).await;
        let (status, response) = send(app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions_total"], 2);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_text() {
        let (status, response) = send(app(vec![]).await, "GET", "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }
}
