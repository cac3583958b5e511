//! HTTP API Server

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::sync::{EngineStatus, SyncEngine};

/// Shared application state
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub started_at: DateTime<Utc>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, engine: Arc<SyncEngine>) -> Self {
        let state = Arc::new(AppState {
            engine,
            started_at: Utc::now(),
        });
        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/stats", get(handle_stats))
            .route("/bulk", post(handle_bulk))
            .route("/states/clear", post(handle_clear))
            .with_state(Arc::clone(&self.state));

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` fires
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub host_id: String,
    pub synchronized: bool,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    #[serde(flatten)]
    pub engine: serde_json::Value,
}

/// Clear request; defaults to this node's states on every interface
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClearRequest {
    pub creator_id: Option<u32>,
    #[serde(default)]
    pub ifname: String,
}

/// Action response
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub accepted: bool,
    pub message: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        host_id: format!("{:08x}", state.engine.host_id()),
        synchronized: state.engine.is_synchronized(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status: EngineStatus = state.engine.status();
    match serde_json::to_value(&status) {
        Ok(engine) => Json(StatusResponse {
            started_at: state.started_at,
            uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
            engine,
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "STATUS_ERROR".into(),
            }),
        )
            .into_response(),
    }
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.stats().snapshot())
}

async fn handle_bulk(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.engine.request_bulk();
    (
        StatusCode::ACCEPTED,
        Json(ActionResponse {
            accepted: true,
            message: "Bulk update requested".into(),
        }),
    )
}

async fn handle_clear(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClearRequest>,
) -> impl IntoResponse {
    let creator_id = req.creator_id.unwrap_or_else(|| state.engine.host_id());
    if creator_id == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "creator id must be non-zero".into(),
                code: "BAD_CREATOR".into(),
            }),
        )
            .into_response();
    }
    if req.ifname.len() >= crate::wire::record::IFNAME_LEN {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("interface name {:?} too long", req.ifname),
                code: "BAD_IFNAME".into(),
            }),
        )
            .into_response();
    }

    state.engine.clear_states(creator_id, &req.ifname);
    (
        StatusCode::ACCEPTED,
        Json(ActionResponse {
            accepted: true,
            message: format!("Clear sent for {:08x}", creator_id),
        }),
    )
        .into_response()
}
