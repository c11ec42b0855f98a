//! Read-only REST API over the result of a run.
//!
//! - `/nodes`: ids, parents and modes of every node
//! - `/nodes/{id}`: one node with its status text
//! - `/logs`: collected log records, filterable by node and time
//! - `/summary`: contract-tracking summary of the root

mod handlers;
mod types;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;

use crate::logline::LogLine;
use crate::sim::{NodeSnapshot, RunSummary, SimResult};

pub use types::{ErrorResponse, LogQuery, NodeInfo};

/// Immutable application state shared by all handlers.
///
/// Built once after the run completes; everything is read-only.
#[derive(Debug)]
pub struct AppState {
    pub summary: RunSummary,
    pub nodes: Vec<NodeSnapshot>,
    pub lines: Vec<LogLine>,
}

impl From<SimResult> for AppState {
    fn from(result: SimResult) -> Self {
        Self {
            summary: result.summary,
            nodes: result.nodes,
            lines: result.lines,
        }
    }
}

/// Builds the router with all API routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{id}", get(handlers::get_node))
        .route("/logs", get(handlers::get_logs))
        .route("/summary", get(handlers::get_summary))
        .with_state(state)
}

/// Binds to `addr` and serves the API until the server fails.
///
/// # Errors
///
/// Returns an `io::Error` if the listener cannot bind or the server stops
/// with an error.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, router(state)).await
}
