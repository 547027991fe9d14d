//! HTTP API Server
//!
//! REST façade for reads, writes and status queries. Requests are
//! bridged onto the native text protocol through `DbClient`, aimed at
//! whichever node is currently the effective leader.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::client::{ClientReply, DbClient};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::state::{ClusterMembership, ClusterState};

/// Shared application state
pub struct AppState {
    cluster: Arc<ClusterMembership>,
    state: Arc<ClusterState>,
}

impl AppState {
    /// Client aimed at the effective leader's client port
    fn leader_client(&self) -> Result<DbClient> {
        let leader_id = self.state.effective_leader();
        if leader_id == 0 {
            return Err(Error::NoLeader);
        }
        let node = self
            .cluster
            .node(leader_id)
            .ok_or(Error::NoLeader)?;
        Ok(DbClient::new(node.host.clone(), self.cluster.client_port()))
    }
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(
        config: ApiConfig,
        cluster: Arc<ClusterMembership>,
        state: Arc<ClusterState>,
    ) -> Self {
        Self {
            config,
            state: Arc::new(AppState { cluster, state }),
        }
    }

    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/v1/status", get(handle_status))
            .route(
                "/v1/kv/:key",
                get(handle_get).put(handle_put).delete(handle_delete),
            )
            .route("/v1/scan", get(handle_scan))
            .with_state(state)
    }

    /// Bind and serve until the process exits
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        let router = Self::create_router(self.state);
        axum::serve(listener, router)
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(())
    }
}

// ---- request/response bodies ----

#[derive(Debug, Deserialize)]
struct PutBody {
    value: String,
}

#[derive(Debug, Serialize)]
struct WriteResponse {
    lsn: u64,
}

#[derive(Debug, Serialize)]
struct ValueResponse {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    node_id: u32,
    role: String,
    term: u64,
    leader_id: u32,
    applied_lsn: u64,
    heartbeat_age_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ScanParams {
    start: String,
    #[serde(default = "default_scan_count")]
    count: usize,
    #[serde(default)]
    backward: bool,
}

fn default_scan_count() -> usize {
    10
}

#[derive(Debug, Serialize)]
struct ScanResponse {
    pairs: Vec<ValueResponse>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

// ---- handlers ----

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cluster_state = &state.state;
    Json(StatusResponse {
        node_id: state.cluster.self_id(),
        role: cluster_state.role().to_string(),
        term: cluster_state.current_term(),
        leader_id: cluster_state.effective_leader(),
        applied_lsn: cluster_state.my_last_seq(),
        heartbeat_age_ms: cluster_state.last_heartbeat_age_ms(),
    })
}

async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    let client = match state.leader_client() {
        Ok(client) => client,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };

    match client.get(&key).await {
        Ok(ClientReply::Value(value)) => Json(ValueResponse { key, value }).into_response(),
        Ok(ClientReply::NotFound) => error_response(StatusCode::NOT_FOUND, "key not found"),
        Ok(other) => error_response(StatusCode::BAD_GATEWAY, format!("{:?}", other)),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn handle_put(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<PutBody>,
) -> axum::response::Response {
    let client = match state.leader_client() {
        Ok(client) => client,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };

    match client.set(&key, &body.value).await {
        Ok(ClientReply::Ok { lsn }) => Json(WriteResponse { lsn }).into_response(),
        Ok(ClientReply::Error(e)) => error_response(StatusCode::CONFLICT, e),
        Ok(other) => error_response(StatusCode::BAD_GATEWAY, format!("{:?}", other)),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    let client = match state.leader_client() {
        Ok(client) => client,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };

    match client.delete(&key).await {
        Ok(ClientReply::Ok { lsn }) => Json(WriteResponse { lsn }).into_response(),
        Ok(ClientReply::Error(e)) => error_response(StatusCode::CONFLICT, e),
        Ok(other) => error_response(StatusCode::BAD_GATEWAY, format!("{:?}", other)),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn handle_scan(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ScanParams>,
) -> axum::response::Response {
    let client = match state.leader_client() {
        Ok(client) => client,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };

    match client.scan(&params.start, params.count, params.backward).await {
        Ok(ClientReply::Pairs(pairs)) => Json(ScanResponse {
            pairs: pairs
                .into_iter()
                .map(|(key, value)| ValueResponse { key, value })
                .collect(),
        })
        .into_response(),
        Ok(ClientReply::Error(e)) => error_response(StatusCode::CONFLICT, e),
        Ok(other) => error_response(StatusCode::BAD_GATEWAY, format!("{:?}", other)),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}
