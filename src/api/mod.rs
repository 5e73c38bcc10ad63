//! HTTP API for health checks, relay status, and operator review

use crate::config::ApiConfig;
use crate::error::RelayerResult;
use crate::state::{IdempotencyLedger, LedgerStats, RelayRecord, RelayStatus};

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Ledger per direction name
    pub ledgers: Arc<BTreeMap<String, Arc<IdempotencyLedger>>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(ledgers: BTreeMap<String, Arc<IdempotencyLedger>>) -> Self {
        Self {
            ledgers: Arc::new(ledgers),
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/directions/:name/records", get(list_records))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Record counts and watermark per direction
async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let mut directions = BTreeMap::new();
    for (name, ledger) in state.ledgers.iter() {
        directions.insert(name.clone(), ledger.stats().await);
    }

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        directions,
    })
}

/// Records of one direction, optionally filtered by status
async fn list_records(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<Vec<RelayRecord>>, (StatusCode, Json<ErrorResponse>)> {
    let ledger = state.ledgers.get(&name).ok_or_else(|| {
        error_response(StatusCode::NOT_FOUND, format!("Unknown direction {}", name))
    })?;

    let records = match query.status.as_deref() {
        Some(status) => {
            let status: RelayStatus = status
                .parse()
                .map_err(|e: crate::error::RelayerError| {
                    error_response(StatusCode::BAD_REQUEST, e.to_string())
                })?;
            ledger.list_by_status(status).await
        }
        None => ledger.list_pending().await,
    };

    Ok(Json(records))
}

fn error_response(status: StatusCode, error: String) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error }))
}

// Request / response types

#[derive(Debug, Default, Deserialize)]
struct RecordsQuery {
    status: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    directions: BTreeMap<String, LedgerStats>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}
