//! HTTP API Server
//!
//! Admin REST API for node health inspection and operator control.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::master::{MasterEngine, Operation, Request, Response, VERSION};
use crate::state::{HealthSummary, NodeReport};

/// Shared application state
pub struct AppState {
    /// Master ID
    pub node_id: String,
    /// Coordination engine
    pub engine: Arc<MasterEngine>,
    /// Process start, for uptime
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node_id: String, engine: Arc<MasterEngine>) -> Self {
        let state = Arc::new(AppState {
            node_id,
            engine,
            started: Instant::now(),
        });

        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/version", get(handle_version))
            .route("/nodes", get(handle_nodes))
            .route("/nodes/:name", get(handle_node_info))
            .route("/nodes/:name/pause", post(handle_pause))
            .route("/nodes/:name/resume", post(handle_resume))
            .route("/nodes/:name/dead", post(handle_dead))
            .route("/nodes/:name/arrive", post(handle_arrive))
            .route("/nodes/:name/recovery/start", post(handle_recovery_start))
            .route("/nodes/:name/recovery/end", post(handle_recovery_end))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
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
    pub node_id: String,
    pub uptime_seconds: u64,
    pub summary: HealthSummary,
}

/// Version response
#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}

/// Result of a control action
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub node: String,
    pub message: Option<String>,
    pub report: Option<NodeReport>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summary = state.engine.failover().summary();
    Json(HealthResponse {
        // a master with no reachable node cannot serve anything
        healthy: summary.arrived > 0 || summary.recovering > 0,
        node_id: state.node_id.clone(),
        uptime_seconds: state.started.elapsed().as_secs(),
        summary,
    })
}

async fn handle_version() -> impl IntoResponse {
    Json(VersionResponse {
        version: VERSION.to_string(),
    })
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.failover().reports())
}

async fn handle_node_info(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> impl IntoResponse {
    match state.engine.failover().report(&name) {
        Some(report) => Json(report).into_response(),
        None => node_not_found(&name),
    }
}

async fn handle_pause(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> impl IntoResponse {
    control(&state, name.clone(), Operation::PauseNode { node: name }).await
}

async fn handle_resume(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> impl IntoResponse {
    control(&state, name.clone(), Operation::ResumeNode { node: name }).await
}

async fn handle_dead(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> impl IntoResponse {
    control(&state, name.clone(), Operation::DeadNode { node: name }).await
}

async fn handle_arrive(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> impl IntoResponse {
    control(&state, name.clone(), Operation::ArriveNode { node: name }).await
}

async fn handle_recovery_start(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> impl IntoResponse {
    control(&state, name.clone(), Operation::StartRecovery { node: name }).await
}

async fn handle_recovery_end(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> impl IntoResponse {
    control(&state, name.clone(), Operation::EndRecovery { node: name }).await
}

/// Run a node control operation through the engine
async fn control(state: &AppState, name: String, operation: Operation) -> axum::response::Response {
    tracing::info!("Admin request: {} {}", operation.name(), name);

    match state.engine.handle(Request::new(operation)).await {
        Response::Success { .. } => Json(ControlResponse {
            success: true,
            report: state.engine.failover().report(&name),
            node: name,
            message: None,
        })
        .into_response(),
        Response::NotFound => node_not_found(&name),
        Response::Error { kind, message } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: message,
                code: format!("{:?}", kind).to_uppercase(),
            }),
        )
            .into_response(),
    }
}

fn node_not_found(name: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Node {} not found", name),
            code: "NODE_NOT_FOUND".to_string(),
        }),
    )
        .into_response()
}
