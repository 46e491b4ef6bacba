//! Operator routes served next to the node API
//!
//! `GET /log-level` shows the active tracing filter and `PUT /log-level`
//! swaps it without a restart.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{reload, EnvFilter, Registry};

pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

type AdminResult<T> = std::result::Result<T, (StatusCode, String)>;

#[derive(Debug, Serialize, Deserialize)]
pub struct LogLevel {
    /// `EnvFilter` directives, e.g. `info,raftkv_raft=debug`
    pub filter: String,
}

pub fn router(filter: FilterHandle) -> Router {
    Router::new()
        .route("/log-level", get(current).put(update))
        .with_state(filter)
}

async fn current(State(filter): State<FilterHandle>) -> AdminResult<Json<LogLevel>> {
    filter
        .with_current(|f| f.to_string())
        .map(|filter| Json(LogLevel { filter }))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn update(
    State(filter): State<FilterHandle>,
    Json(body): Json<LogLevel>,
) -> AdminResult<StatusCode> {
    let next =
        EnvFilter::try_new(&body.filter).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    filter
        .reload(next)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    tracing::info!(filter = %body.filter, "log filter changed");
    Ok(StatusCode::NO_CONTENT)
}
