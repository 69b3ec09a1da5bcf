//! HTTP adapter: routing, authentication, body parsing and error mapping.

mod body;
mod error;
mod handlers;
mod middleware;
mod state;

pub use body::RenderInput;
pub use error::{ApiError, ApiErrorBody, messages};
pub use middleware::RequestContext;
pub use state::AppState;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};

/// Build the service router: authenticated render routes plus an open health check.
pub fn build_router(state: AppState) -> Router {
    let render_routes = Router::new()
        .route("/render", post(handlers::render_html))
        .route("/render/pdf", post(handlers::render_pdf))
        .layer(DefaultBodyLimit::max(state.max_body_bytes()))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::require_api_key,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .merge(render_routes)
        .layer(from_fn(middleware::log_responses))
        .layer(from_fn(middleware::set_request_context))
        .with_state(state)
}
