use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use parley_gateway::auth::{self, TokenVerifier};
use parley_gateway::connection::{self, Heartbeat};
use parley_gateway::router::MessageRouter;

#[derive(Clone)]
pub struct AppState {
    pub router: MessageRouter,
    pub verifier: Arc<dyn TokenVerifier>,
    pub heartbeat: Heartbeat,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Upgrade handshake. Malformed upgrade requests are rejected by the
/// extractor (400); a bad credential gets 401 and never reaches the router.
async fn ws_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> Response {
    let user_id = match auth::authenticate(&headers, state.verifier.as_ref()) {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!(error = %e, "Rejected WebSocket upgrade");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.router, user_id, state.heartbeat))
}
