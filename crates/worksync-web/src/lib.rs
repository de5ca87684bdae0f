//! HTTP trigger endpoint for worksync.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};
use worksync_sync::{SyncService, TriggerOutcome, TriggerSource};

pub const CRATE_NAME: &str = "worksync-web";

pub const DEFAULT_AUTH_TOKEN: &str = "default-secret-token";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub auth_token: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_token: DEFAULT_AUTH_TOKEN.to_string(),
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            auth_token: std::env::var("WORKER_AUTH_TOKEN")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.auth_token),
        }
    }

    pub fn uses_default_token(&self) -> bool {
        self.auth_token == DEFAULT_AUTH_TOKEN
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: SyncService,
    pub auth_token: String,
}

impl AppState {
    pub fn new(service: SyncService, auth_token: impl Into<String>) -> Self {
        Self {
            service,
            auth_token: auth_token.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    status: &'static str,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(sync_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Binds `0.0.0.0:PORT` and serves until the process exits. Bind failure is fatal.
pub async fn serve(config: &WebConfig, service: SyncService) -> anyhow::Result<()> {
    if config.uses_default_token() {
        warn!("WORKER_AUTH_TOKEN not set; using the built-in development token");
    }
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "trigger endpoint listening");
    axum::serve(listener, app(AppState::new(service, config.auth_token.clone())))
        .await
        .context("serving trigger endpoint")?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !is_authorized(&headers, &state.auth_token) {
        warn!("rejected sync trigger with missing or invalid token");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    match state.service.trigger(TriggerSource::Manual) {
        TriggerOutcome::Accepted(ticket) => {
            info!(run_id = %ticket.run_id, "manual sync accepted");
            (
                StatusCode::ACCEPTED,
                Json(TriggerResponse {
                    status: "accepted",
                    message: "Sync started in background",
                    run_id: Some(ticket.run_id.to_string()),
                }),
            )
                .into_response()
        }
        TriggerOutcome::AlreadyRunning => (
            StatusCode::CONFLICT,
            Json(TriggerResponse {
                status: "already_running",
                message: "A sync pass is already in progress",
                run_id: None,
            }),
        )
            .into_response(),
    }
}

fn is_authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == token)
}
