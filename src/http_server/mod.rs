use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::AppError;
use crate::lifecycle::ServerManager;

pub mod server_routes;
pub mod websocket_handler;

/// Shared handler state: everything lives behind the manager.
pub struct AppState {
    pub manager: Arc<ServerManager>,
}

/// Static API-key check applied to the `/servers` routes.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    if provided == Some(state.manager.config.api_key.as_str()) {
        next.run(request).await
    } else {
        warn!("Rejected request with missing or invalid API key.");
        AppError::InvalidToken.into_response()
    }
}

async fn state_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn build_router(manager: Arc<ServerManager>) -> Router {
    let state = Arc::new(AppState { manager });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let servers = server_routes::servers_router().route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_api_key,
    ));

    Router::new()
        .route("/", get(websocket_handler::websocket_handler))
        .nest(
            "/api/v1",
            Router::new()
                .route("/state", get(state_handler))
                .nest("/servers", servers),
        )
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn run_http_server(
    manager: Arc<ServerManager>,
    bind: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = bind.parse()?;
    let router = build_router(manager);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening.");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
