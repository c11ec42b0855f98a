//! Request handlers for the API endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use super::AppState;
use super::types::{ErrorResponse, LogQuery, NodeInfo};
use crate::logline::LogLine;
use crate::sim::{NodeSnapshot, RunSummary};

/// `GET /nodes` → 200 + `Vec<NodeInfo>` JSON
pub async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<NodeInfo>> {
    Json(state.nodes.iter().map(NodeInfo::from).collect())
}

/// `GET /nodes/{id}` → 200 + `NodeSnapshot` JSON, or 404 + `ErrorResponse`
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<NodeSnapshot>, (StatusCode, Json<ErrorResponse>)> {
    state
        .nodes
        .iter()
        .find(|node| node.id == id)
        .cloned()
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("unknown node \"{id}\""),
                }),
            )
        })
}

/// Returns log records, optionally filtered by node and time range.
///
/// `GET /logs` → 200 + `Vec<LogLine>` JSON
/// `GET /logs?node=bus_0&from=N&to=M` → filtered (inclusive, epoch ms)
/// `GET /logs?from=10&to=5` → 400 + `ErrorResponse`
pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("`from` ({from}) must be <= `to` ({to})"),
                }),
            ));
        }
    }

    let lines: Vec<LogLine> = state
        .lines
        .iter()
        .filter(|line| query.matches(&line.id, line.now))
        .cloned()
        .collect();
    Ok(Json(lines))
}

/// `GET /summary` → 200 + `RunSummary` JSON
pub async fn get_summary(State(state): State<Arc<AppState>>) -> Json<RunSummary> {
    Json(state.summary.clone())
}
