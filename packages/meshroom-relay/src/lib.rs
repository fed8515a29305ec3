//! Meshroom signaling relay.
//!
//! A lightweight WebSocket relay that lets browsers and native clients in the
//! same room find each other and exchange WebRTC offers, answers and ICE
//! candidates. Media never passes through it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   join-room    ┌───────────────────────────────┐
//! │ Client A │ ─────────────► │          RelayState           │
//! └──────────┘                │                               │
//!      ▲                      │  sessions: id → outbound tx   │
//!      │ offer {from: B}      │  registry: room → [id, ...]   │
//!      │                      └───────────────────────────────┘
//! ┌──────────┐  offer {to: A}         │
//! │ Client B │ ───────────────────────┘
//! └──────────┘
//! ```
//!
//! Each connection gets a relay-assigned session id (the `welcome` frame).
//! Membership changes fan out as `existing-users`, `user-joined` and
//! `user-left`; signaling messages are forwarded verbatim between members of
//! the same room.

pub mod handler;
pub mod protocol;
pub mod registry;
pub mod state;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{RoomError, RoomRegistry};
pub use state::{RelayConfig, RelayState};

/// Build the relay's HTTP + WebSocket router.
pub fn router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/rooms", get(rooms_handler))
        .route("/rooms/:room_id", get(room_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "meshroom-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "active_rooms": state.active_rooms(),
    }))
}

/// Room id → member count for every active room.
async fn rooms_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(state.room_counts())
}

async fn room_handler(
    Path(room_id): Path<String>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    match state.member_count(&room_id) {
        Some(count) => (
            StatusCode::OK,
            Json(json!({ "room_id": room_id, "member_count": count })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Room '{}' not found", room_id) })),
        ),
    }
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(state.stats())
}
