//! REST API for the Mnemos memory subsystem.
//!
//! Every memory route is scoped to the tenant named by the `x-owner-id`
//! header; requests without it are rejected with 400.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /memories` - Store a memory directly
//! - `GET /memories` - List the owner's memories
//! - `GET /memories/search?q=...&limit=...&hints=a,b` - Ranked retrieval
//! - `GET /memories/{id}` / `DELETE /memories/{id}`
//! - `GET /memories/{id}/relationships` - Stored edges
//! - `POST /context` - Prompt-ready memory block
//! - `POST /turns` - Queue detection for a chat turn (202)
//! - `DELETE /tasks/{id}` - Cancel a queued task
//! - `GET /stats` - Store, queue, breaker and latency snapshot
//!
//! # Architecture
//!
//! ```text
//! Chat service
//!    │
//!    ▼
//! ┌─────────────────┐
//! │   API (Axum)    │ ◄── This crate
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │  MemoryService  │ ──▶ │ Background pool │
//! └─────────────────┘     └─────────────────┘
//! ```

pub mod config;
pub mod routes;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use config::{AppConfig, ServerConfig};
pub use state::AppState;

/// Create the API router with all routes configured.
///
/// `cors_origins` empty allows any origin.
pub fn create_router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let cors = build_cors(cors_origins);

    Router::new()
        .route("/health", get(routes::health))
        .route("/memories", post(routes::create_memory).get(routes::list_memories))
        .route("/memories/search", get(routes::search_memories))
        .route(
            "/memories/{id}",
            get(routes::get_memory).delete(routes::delete_memory),
        )
        .route("/memories/{id}/relationships", get(routes::memory_relationships))
        .route("/context", post(routes::build_context))
        .route("/turns", post(routes::observe_turn))
        .route("/tasks/{id}", delete(routes::cancel_task))
        .route("/stats", get(routes::stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

/// Serve until Ctrl-C, then stop the background workers and write the
/// snapshot.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr, cors_origins: &[String]) -> anyhow::Result<()> {
    let router = create_router(state.clone(), cors_origins);

    info!(%addr, "Starting Mnemos API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, shutting down memory service");
    state.memory.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
