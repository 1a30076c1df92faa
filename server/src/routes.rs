use axum::{routing::get, Router};

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the axum Router. The relay speaks only WebSocket; the upgrade is
/// served at `/` for plain `ws://host:port` clients and at `/ws`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler::ws_upgrade))
        .route("/ws", get(ws_handler::ws_upgrade))
        .with_state(state)
}
