//! HTTP and WebSocket surface over `arm2-session`: one axum `Router` exposing session lifecycle,
//! execution control, inspection, and a live event stream, plus a read-only example library.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod ws;

pub use routes::build_router;
pub use state::AppState;

use std::net::SocketAddr;

use log::info;

/// Binds `addr` and serves until the process is killed or the returned future is dropped.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, router.into_make_service()).await
}
