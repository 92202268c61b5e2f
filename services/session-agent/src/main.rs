//! Session Agent
//!
//! Single-binary Rust service that:
//! 1. Restores or establishes a user session against the remote API
//! 2. Keeps the access token fresh (proactive timer, refresh on 401)
//! 3. Forwards local requests to the API with the session's bearer token
//! 4. Surfaces session expiry and forced logout through the auth flow

mod config;
mod driver;
mod error;
mod flow;
mod forward;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use api_transport::ReqwestTransport;
use session_auth::{FileStore, HttpAuthClient};
use session_core::{AuthPipeline, BroadcastBus, SessionManager};

use crate::config::Config;
use crate::driver::{DriverOptions, FlowHandle};
use crate::flow::FlowState;

/// Time allowed for in-flight requests after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    manager: Arc<SessionManager>,
    pipeline: AuthPipeline,
    flow: FlowHandle,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Everything outside the agent's own routes is forwarded to the remote API.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/session", get(session_handler))
        .route("/session/acknowledge", post(acknowledge_handler))
        .route("/session/logout", post(logout_handler))
        .fallback(forward_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting session-agent");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install metrics recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.agent.listen_addr,
        base_url = %config.api.base_url,
        store = %config.session.store_path.display(),
        "configuration loaded"
    );

    let store = FileStore::load(config.session.store_path.clone())
        .await
        .map_err(error::Error::Store)?;
    let http = reqwest::Client::new();
    let auth_client = HttpAuthClient::new(http.clone(), &config.api.base_url, config.timeout())
        .with_endpoints(config.endpoints());

    let manager = Arc::new(SessionManager::new(
        Arc::new(store),
        Arc::new(auth_client),
        Arc::new(BroadcastBus::new()),
        config.coordinator(),
    ));
    let _bridge = manager.spawn_event_bridge();

    let initial = establish_session(&manager, &config).await?;
    info!(flow = initial.label(), "session established");

    let (flow, _driver) = driver::spawn(
        Arc::clone(&manager),
        DriverOptions {
            relogin: config.login_request(),
            auto_acknowledge: config.session.auto_acknowledge,
        },
        initial,
    );

    let transport = Arc::new(ReqwestTransport::new(
        http,
        &config.api.base_url,
        config.timeout(),
    ));
    let app_state = AppState {
        pipeline: manager.pipeline(transport),
        manager: Arc::clone(&manager),
        flow,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.agent.max_connections);

    let listen_addr = config.agent.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    // The session stays in the store for the next run; only the timer stops
    manager.coordinator().cancel_timer_task();
    metrics::set_session_active(false);

    info!("shutdown complete");
    Ok(())
}

/// Resume the stored session, or sign in with configured credentials.
async fn establish_session(manager: &SessionManager, config: &Config) -> error::Result<FlowState> {
    if manager.restore().await.map_err(error::Error::Login)? {
        let email = manager.projection().snapshot().user.and_then(|u| u.email);
        return Ok(FlowState::Authenticated { email });
    }

    let request = config.login_request().ok_or(error::Error::NoCredentials)?;
    manager
        .login(&request)
        .await
        .map_err(error::Error::Login)?;
    Ok(FlowState::Authenticated {
        email: Some(request.email),
    })
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Health endpoint: 200 while signed in, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.manager.projection().snapshot();
    let coordinator = state.manager.coordinator();
    let status_code = if snapshot.is_logged_in {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    json_response(
        status_code,
        serde_json::json!({
            "status": if snapshot.is_logged_in { "healthy" } else { "signed_out" },
            "flow": state.flow.state().label(),
            "refreshing": coordinator.is_refreshing(),
            "queued_requests": coordinator.queued_waiters(),
            "refresh_timer_armed": coordinator.has_armed_timer(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

/// Prometheus metrics endpoint in text exposition format.
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

/// Current session, with tokens reduced to fingerprints.
async fn session_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.manager.projection().snapshot();
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "logged_in": snapshot.is_logged_in,
            "flow": state.flow.state().label(),
            "user": snapshot.user,
            "profile": snapshot.profile,
            "access_token": snapshot.access_token.as_deref().map(common::fingerprint),
        }),
    )
}

/// Confirm the expiry prompt. 409 when no prompt is showing.
async fn acknowledge_handler(State(state): State<AppState>) -> Response {
    let FlowState::ExpiryPrompt { message } = state.flow.state() else {
        return json_response(
            StatusCode::CONFLICT,
            serde_json::json!({"error": {"type": "no_prompt", "message": "no session expiry is awaiting confirmation"}}),
        );
    };
    if !state.flow.confirm_prompt().await {
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({"error": {"type": "agent_error", "message": "auth flow is not running"}}),
        );
    }
    json_response(
        StatusCode::ACCEPTED,
        serde_json::json!({"acknowledged": message}),
    )
}

async fn logout_handler(State(state): State<AppState>) -> Response {
    if let Err(e) = state.manager.logout().await {
        error!(error = %e, "logout failed");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({"error": {"type": "agent_error", "message": e.to_string()}}),
        );
    }
    if !state.flow.signed_out().await {
        warn!("auth flow is not running");
    }
    json_response(StatusCode::OK, serde_json::json!({"logged_in": false}))
}

/// Catch-all handler that forwards to the remote API.
async fn forward_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    forward::forward_request(&state.pipeline, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
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
