use axum::{
    routing::{get, post, put},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the main application router with all routes and middleware
#[tracing::instrument(skip(state))]
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Long-lived streams, no request timeout
    let stream_routes = Router::new()
        .route("/websocket", get(handlers::connection::websocket_handler))
        .route("/metrics", get(handlers::feed::feed_handler))
        .route("/api/events", get(handlers::sse::sse_handler));

    let api_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/api/messages",
            post(handlers::messages::send_message).get(handlers::messages::list_messages),
        )
        .route("/api/messages/:id", get(handlers::messages::get_message))
        .route("/api/plans", put(handlers::plans::upsert_plan))
        .route(
            "/api/plans/:id",
            get(handlers::plans::get_plan).delete(handlers::plans::delete_plan),
        )
        .route("/api/plans/:id/enable", put(handlers::plans::enable_plan))
        .route("/api/plans/:id/disable", put(handlers::plans::disable_plan))
        .route(
            "/api/plans/:id/executions",
            get(handlers::plans::list_executions),
        )
        .layer(TimeoutLayer::new(API_TIMEOUT));

    Router::new()
        .merge(stream_routes)
        .merge(api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
