//! Web server module
//!
//! One WebSocket upgrade endpoint (`/ws`) plus a liveness probe. The model
//! adapters are passed in at construction so tests can substitute fakes.

pub mod connection;
pub mod outbound;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::models::ModelClients;
use registry::MemoryRegistry;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub clients: ModelClients,
    pub registry: Arc<MemoryRegistry>,
}

impl ServerState {
    pub fn new(config: Arc<Config>, clients: ModelClients) -> Self {
        let registry = Arc::new(MemoryRegistry::new(Duration::from_secs(
            config.server.memory_grace_s,
        )));
        Self { config, clients, registry }
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Logical session identity; reconnecting with the same id within the
    /// grace period resumes the conversation memory.
    #[serde(default)]
    connection_id: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<ServerState>,
) -> Response {
    let connection_id = query
        .connection_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| connection::serve_connection(socket, state, connection_id))
}

async fn healthz() -> &'static str {
    "ok"
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn start(state: ServerState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
        .context("invalid bind address")?;

    info!("listening on http://{addr} (WebSocket endpoint at /ws)");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, router(state))
        .await
        .context("server error")?;
    Ok(())
}
