//! Read-only JSON view of the index for operators.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json, Router, routing::get};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::server::IndexState;
use super::types::{FileListing, RoutingDecision};
use crate::error::CdnError;
use crate::membership::types::{NodeId, NodeState};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub nodes: usize,
    pub alive_nodes: usize,
    pub files: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerStatus {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    pub load: u64,
    pub state: NodeState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub decision: Option<RoutingDecision>,
    pub error: Option<String>,
}

pub fn router(state: Arc<IndexState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/servers", get(handle_servers))
        .route("/files", get(handle_files))
        .route("/resolve/:name", get(handle_resolve))
        .layer(Extension(state))
}

pub async fn handle_health(
    Extension(state): Extension<Arc<IndexState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.membership.snapshot();
    let servers = state.directory.list_servers(&snapshot);

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            nodes: servers.len(),
            alive_nodes: servers
                .iter()
                .filter(|row| row.state == NodeState::Alive)
                .count(),
            files: state.directory.file_name_count(),
        }),
    )
}

pub async fn handle_servers(
    Extension(state): Extension<Arc<IndexState>>,
) -> (StatusCode, Json<Vec<ServerStatus>>) {
    let snapshot = state.membership.snapshot();
    let servers = state
        .directory
        .list_servers(&snapshot)
        .into_iter()
        .map(|row| ServerStatus {
            id: row.id,
            host: row.address.host,
            port: row.address.port,
            load: row.load,
            state: row.state,
        })
        .collect();

    (StatusCode::OK, Json(servers))
}

pub async fn handle_files(
    Extension(state): Extension<Arc<IndexState>>,
) -> (StatusCode, Json<Vec<FileListing>>) {
    let snapshot = state.membership.snapshot();
    (StatusCode::OK, Json(state.directory.list_files(&snapshot)))
}

pub async fn handle_resolve(
    Extension(state): Extension<Arc<IndexState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<ResolveResponse>) {
    let snapshot = state.membership.snapshot();

    match state.directory.resolve(&name, &snapshot) {
        Ok(decision) => (
            StatusCode::OK,
            Json(ResolveResponse {
                decision: Some(decision),
                error: None,
            }),
        ),
        Err(e) => {
            let status = match e {
                CdnError::NotFound(_) => StatusCode::NOT_FOUND,
                CdnError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(ResolveResponse {
                    decision: None,
                    error: Some(e.wire_token().to_string()),
                }),
            )
        }
    }
}
