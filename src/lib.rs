use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub mod auth;
pub mod builtin;
pub mod config;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod progress;
pub mod rate_limit;
pub mod registry;
pub mod resilience;
pub mod session;

use mcp::dispatcher::Dispatcher;
use progress::NotificationHub;
use session::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub api_token: Option<Arc<str>>,
    pub sessions: Arc<dyn SessionStore>,
    pub hub: Arc<NotificationHub>,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(
        api_token: Option<String>,
        sessions: Arc<dyn SessionStore>,
        hub: Arc<NotificationHub>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            api_token: api_token.map(Arc::<str>::from),
            sessions,
            hub,
            dispatcher: Arc::new(dispatcher),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/mcp",
            post(http::handlers::mcp_endpoint).delete(http::handlers::delete_session),
        )
        .route("/mcp/sse", get(http::handlers::sse_endpoint))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer_token,
        ));

    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .merge(protected)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}
