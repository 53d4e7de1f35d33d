//! Wires every handler to its path and layers on the cross-cutting policies: a CORS origin
//! allow-list, a request body size cap, and read/write/idle timeouts.

use std::time::Duration;

use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws::ws_handler;

const MAX_BODY_BYTES: usize = 1024 * 1024;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .allow_origin(tower_http::cors::AllowOrigin::predicate(|origin: &HeaderValue, _| {
            origin_is_allowed(origin)
        }))
}

/// `file://` pages have no `Origin` header at all and are allowed implicitly by browsers; this
/// predicate only has to gate actual `Origin` values, which are always `http(s)://host[:port]`.
fn origin_is_allowed(origin: &HeaderValue) -> bool {
    let Ok(origin) = origin.to_str() else { return false };
    origin.starts_with("http://localhost")
        || origin.starts_with("https://localhost")
        || origin.starts_with("http://127.0.0.1")
        || origin.starts_with("https://127.0.0.1")
}

pub fn build_router(state: AppState) -> Router {
    let session_routes = Router::new()
        .route("/", post(handlers::create_session).get(handlers::list_sessions))
        .route("/:id", get(handlers::get_session).delete(handlers::destroy_session))
        .route("/:id/load", post(handlers::load_program))
        .route("/:id/run", post(handlers::run_session))
        .route("/:id/stop", post(handlers::stop_session))
        .route("/:id/step", post(handlers::step))
        .route("/:id/step-over", post(handlers::step_over))
        .route("/:id/step-out", post(handlers::step_out))
        .route("/:id/reset", post(handlers::reset_session))
        .route("/:id/registers", get(handlers::registers))
        .route("/:id/memory", get(handlers::memory))
        .route("/:id/disassembly", get(handlers::disassembly))
        .route("/:id/breakpoint", post(handlers::add_breakpoint).delete(handlers::remove_breakpoint))
        .route("/:id/breakpoints", get(handlers::list_breakpoints))
        .route("/:id/watchpoint", post(handlers::add_watchpoint))
        .route("/:id/watchpoint/:watchpoint_id", delete(handlers::remove_watchpoint))
        .route("/:id/watchpoints", get(handlers::list_watchpoints))
        .route("/:id/trace/:action", post(handlers::trace_toggle))
        .route("/:id/trace/data", get(handlers::trace_data))
        .route("/:id/stats/:action", post(handlers::stats_toggle))
        .route("/:id/stats", get(handlers::stats))
        .route("/:id/stdin", post(handlers::send_stdin))
        .route("/:id/evaluate", post(handlers::evaluate));

    let api = Router::new()
        .route("/health", get(handlers::health))
        .nest("/session", session_routes)
        .route("/examples", get(handlers::list_examples))
        .route("/ws", get(ws_handler));

    Router::new()
        .nest("/api/v1", api)
        .route("/examples/:name", get(handlers::get_example))
        .fallback(not_found)
        .layer(cors_layer())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(tower_http::timeout::TimeoutLayer::new(IDLE_TIMEOUT))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
