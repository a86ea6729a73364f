//! Kisan Relay
//!
//! Real-time call signaling and presence for the Kisan community app:
//!
//! 1. **Presence**: tracks which live WebSocket connection each user is
//!    reachable on. The most recent `register` wins.
//!
//! 2. **Call handshake**: rings a callee on behalf of a caller and drives
//!    one state machine (pending → accepted → ended, or rejected) for both
//!    peer-to-peer calls and specialist (vet) calls.
//!
//! 3. **Signaling relay**: forwards WebRTC offers, answers and ICE
//!    candidates between room members without looking inside them.
//!
//! 4. **Room chat**: persists chat messages and broadcasts them, plus edits
//!    and deletions, to the room they belong to.
//!
//! Delivery is best-effort throughout. An offline user is a routing miss
//! (`noAnswer`, or silence), not an error.

pub mod api;
pub mod call;
pub mod chat;
pub mod directory;
pub mod error;
pub mod handler;
pub mod presence;
pub mod protocol;
pub mod rooms;
pub mod signaling;
pub mod state;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{RelayError, Result};
pub use state::{RelayConfig, RelayState};

/// Build the HTTP router: the WebSocket endpoint, operational endpoints
/// and the REST adapter.
pub fn build_router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(api::health_handler))
        .route("/stats", get(api::stats_handler))
        .route("/presence", get(api::presence_handler))
        .merge(api::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// WebSocket upgrade handler for client connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}
