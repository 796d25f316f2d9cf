//! HTTP API for health checks and solver status

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::coordination::SwapRegistry;
use crate::error::{SolverError, SolverResult};
use crate::state::StateStore;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub chain_manager: Arc<ChainManager>,
    pub registry: Arc<SwapRegistry>,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/checkpoints/:network", get(get_checkpoint))
        .route("/nodes/:network", get(get_nodes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SolverResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SolverError::Config(format!("Cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| SolverError::Internal(format!("API server stopped: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - every network has a reachable node
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let details: Vec<NetworkHealth> = state
        .chain_manager
        .health_check()
        .await
        .into_iter()
        .map(|(network, healthy)| NetworkHealth { network, healthy })
        .collect();
    let ready = details.iter().all(|n| n.healthy);

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, details }))
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let mut networks = state.chain_manager.connected_networks();
    networks.sort();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: state.started_at,
        uptime_seconds: (Utc::now() - state.started_at).num_seconds().max(0) as u64,
        networks,
        active_swaps: state.registry.active(),
    })
}

/// Scanner checkpoint of one network
async fn get_checkpoint(
    State(state): State<AppState>,
    Path(network): Path<String>,
) -> Result<Json<CheckpointResponse>, StatusCode> {
    match state.store.load_checkpoint(&network).await {
        Ok(Some(checkpoint)) => Ok(Json(CheckpointResponse {
            network,
            last_processed_block: checkpoint.last_processed_block,
            remembered_transactions: checkpoint.processed_transaction_hashes.len(),
        })),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!("Failed to load checkpoint for {}: {}", network, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Node scores of one network, best first
async fn get_nodes(
    State(state): State<AppState>,
    Path(network): Path<String>,
) -> Result<Json<Vec<NodeScore>>, StatusCode> {
    let mut scores = state.store.node_scores(&network).await.map_err(|e| {
        warn!("Failed to load node scores for {}: {}", network, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    scores.sort_by(|a, b| b.1.cmp(&a.1));

    Ok(Json(
        scores
            .into_iter()
            .map(|(node, score)| NodeScore { node, score })
            .collect(),
    ))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    details: Vec<NetworkHealth>,
}

#[derive(Serialize)]
struct NetworkHealth {
    network: String,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    started_at: DateTime<Utc>,
    uptime_seconds: u64,
    networks: Vec<String>,
    active_swaps: usize,
}

#[derive(Serialize)]
struct CheckpointResponse {
    network: String,
    last_processed_block: Option<u64>,
    remembered_transactions: usize,
}

#[derive(Serialize)]
struct NodeScore {
    node: String,
    score: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SelectorConfig, Settings};
    use crate::state::{MemoryStore, ScannerState};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    const SETTINGS: &str = r#"
        [solver]
        instance_id = "solver-1"
        health_check_interval_secs = 30

        [database]
        max_connections = 1
        min_connections = 1

        [api]
        host = "127.0.0.1"
        port = 0

        [metrics]
        enabled = false
        port = 0

        [networks.sepolia]
        name = "ETHEREUM_SEPOLIA"
        family = "evm"
        chain_id = 11155111
        rpc_urls = ["http://127.0.0.1:8545"]
        htlc_contract_address = "0x0000000000000000000000000000000000000001"
        native_asset = "ETH"
        confirmation_blocks = 1
        fee_strategy = "legacy"
        max_gas_price_gwei = 100
        enabled = true

        [networks.sepolia.listener]
        block_batch_size = 100
        poll_interval_ms = 1000
    "#;

    fn app(store: Arc<MemoryStore>) -> Router {
        let settings = Settings::from_toml(SETTINGS).unwrap();
        let chain_manager = Arc::new(ChainManager::new(&settings, store.clone()).unwrap());
        let (registry, _rx) = SwapRegistry::new(store.clone());

        router(AppState {
            store,
            chain_manager,
            registry: Arc::new(registry),
            started_at: Utc::now(),
        })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(app(Arc::new(MemoryStore::new())), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_checkpoint_lookup() {
        let store = Arc::new(MemoryStore::new());
        let mut checkpoint = ScannerState {
            last_processed_block: Some(1234),
            ..Default::default()
        };
        checkpoint.processed_transaction_hashes.insert("commit:0xaa");
        store.save_checkpoint("ETHEREUM_SEPOLIA", &checkpoint).await.unwrap();

        let (status, body) = get_json(app(store.clone()), "/checkpoints/ETHEREUM_SEPOLIA").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["last_processed_block"], 1234);
        assert_eq!(body["remembered_transactions"], 1);

        let (status, _) = get_json(app(store), "/checkpoints/UNKNOWN").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_nodes_sorted_by_score() {
        let store = Arc::new(MemoryStore::new());
        let bounds = SelectorConfig::default();
        store.adjust_node_score("ETHEREUM_SEPOLIA", "rpc-a", -10, &bounds).await.unwrap();
        store.adjust_node_score("ETHEREUM_SEPOLIA", "rpc-b", 10, &bounds).await.unwrap();

        let (status, body) = get_json(app(store), "/nodes/ETHEREUM_SEPOLIA").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["node"], "rpc-b");
        assert_eq!(body[0]["score"], 60);
        assert_eq!(body[1]["score"], 40);
    }

    #[tokio::test]
    async fn test_status_lists_networks() {
        let (status, body) = get_json(app(Arc::new(MemoryStore::new())), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["networks"][0], "ETHEREUM_SEPOLIA");
        assert_eq!(body["active_swaps"], 0);
    }
}
