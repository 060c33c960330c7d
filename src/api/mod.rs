//! HTTP API for trade intake and status

use crate::config::ApiConfig;
use crate::dispatch::Dispatcher;
use crate::error::{OrchestratorError, OrchestratorResult};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Debug, Deserialize)]
struct StartTradeRequest {
    business_logic_id: String,
    trade_params: Value,
}

#[derive(Debug, Serialize)]
struct StartTradeResponse {
    trade_id: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/trades", post(start_trade))
        .route("/trades/:business_logic_id/:trade_id", get(trade_status))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { dispatcher })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, dispatcher: Arc<Dispatcher>) -> OrchestratorResult<()> {
    let app = router(dispatcher);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| OrchestratorError::Config(format!("cannot bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Start a trade; responds with the assigned trade id
async fn start_trade(
    State(state): State<AppState>,
    Json(request): Json<StartTradeRequest>,
) -> impl IntoResponse {
    match state
        .dispatcher
        .start_trade(&request.business_logic_id, request.trade_params)
        .await
    {
        Ok(trade_id) => (StatusCode::ACCEPTED, Json(StartTradeResponse { trade_id })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Current state of one trade
async fn trade_status(
    State(state): State<AppState>,
    Path((business_logic_id, trade_id)): Path<(String, String)>,
) -> impl IntoResponse {
    match state
        .dispatcher
        .trade_status(&business_logic_id, &trade_id)
        .await
    {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: OrchestratorError) -> axum::response::Response {
    let status = match &e {
        OrchestratorError::TradeNotFound { .. }
        | OrchestratorError::BusinessLogicNotFound { .. }
        | OrchestratorError::ValidatorNotFound { .. } => StatusCode::NOT_FOUND,
        OrchestratorError::Application { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}
