use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

use super::server::streamable_http_service;

/// HTTP surface: the MCP endpoint plus a health route exposing pool stats.
pub fn mcp_router(state: AppState) -> Router {
    let mcp_path = state.config.server.mcp_path.clone();
    let mcp_service = streamable_http_service(state.clone());

    Router::new()
        .route("/health", get(health))
        .nest_service(&mcp_path, mcp_service)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "stats": state.recognition.stats(),
    }))
}
