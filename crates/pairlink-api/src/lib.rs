//! pairlink-api — the HTTP and WebSocket surface of the relay.

pub mod handlers;
pub mod ws;

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::{ApiState, IpRateLimiter};

pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(handlers::handle_health))
        .route(
            "/api/v1/pair",
            axum::routing::post(handlers::handle_pair_create),
        )
        .route(
            "/api/v1/pair/{token}",
            get(handlers::handle_pair_status).delete(handlers::handle_pair_delete),
        )
        .route(
            "/api/v1/register",
            axum::routing::post(handlers::handle_register),
        )
        .route("/api/v1/tokens", get(handlers::handle_token_list))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves, then stop accepting and
/// let in-flight connections drain.
pub async fn serve(
    state: ApiState,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "relay listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}
