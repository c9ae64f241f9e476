use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State, ws::WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::http_server::AppState;
use crate::ws::session;

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    server: Option<String>,
    token: Option<String>,
}

/// Upgrade endpoint for live sessions: `/?server=<id>&token=<t>`.
///
/// Missing parameters still upgrade; the session closes with the proper
/// policy code so browser clients see a websocket close, not an HTTP error.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<SocketQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let ip = addr.ip();
    if !state.manager.sessions.try_acquire_ip(ip) {
        warn!(ip = %ip, "Connection rejected: per-IP bound reached.");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let server = query.server.unwrap_or_default();
    let token = query.token.unwrap_or_default();
    info!(ip = %ip, server_id = %server, "Live session connection request.");

    let manager = state.manager.clone();
    ws.on_upgrade(move |socket| session::run_session(socket, manager, server, token, Some(ip)))
}
