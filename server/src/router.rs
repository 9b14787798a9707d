//! Route assembly, shared between the binary entry point and integration
//! tests so neither duplicates the other's wiring.

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{auth::ApiKey, routes, state::AppState, ws};

/// Build the full application router (public + authed + WebSocket routes,
/// CORS, tracing, and the connection-limit layer) over the given state.
pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route(
            "/sessions",
            get(routes::sessions::list_sessions).post(routes::sessions::create_session),
        )
        .route(
            "/sessions/{id}",
            get(routes::sessions::get_session).delete(routes::sessions::delete_session),
        )
        .route("/sessions/{id}/resize", post(routes::sessions::resize_session))
        .route("/sessions/{id}/reset-size", post(routes::sessions::reset_size))
        .route("/sessions/{id}/input", post(routes::sessions::send_input))
        .route("/sessions/{id}/stream", get(routes::events::session_stream))
        .route("/cleanup-exited", post(routes::sessions::cleanup_exited))
        .route("/sessions/bulk", post(routes::sessions::bulk_create))
        .route("/bulk/delete", post(routes::sessions::bulk_delete))
        .route("/bulk/resize", post(routes::sessions::bulk_resize))
        .route("/events", get(routes::events::event_stream))
        .layer(middleware::from_fn(crate::auth::require_api_key));

    let ws_route = Router::new().route("/ws", get(ws::ws_upgrade));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(state.config.server.max_connections))
}
