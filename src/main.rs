use std::sync::Arc;

use mcp_session_runtime::{
    build_app,
    builtin::RuntimeProvider,
    config::{Config, SessionBackend},
    logging,
    mcp::dispatcher::Dispatcher,
    progress::{NotificationHub, ProgressTracker},
    rate_limit::TokenBucket,
    registry::{
        PromptProvider, PromptRegistry, ResourceProvider, ResourceRegistry, ToolProvider,
        ToolRegistry,
    },
    resilience::{CircuitBreakerConfig, Resilience, RetryPolicy},
    session::{DistributedSessionStore, LocalSessionStore, RedisCache, SessionStore},
    AppState,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let bind_socket = config.bind_socket()?;

    let sessions: Arc<dyn SessionStore> = match &config.session_backend {
        SessionBackend::Local => {
            let store = Arc::new(LocalSessionStore::new(config.session_ttl));
            store.spawn_sweeper(config.session_sweep_interval);
            store
        }
        SessionBackend::Redis { url } => {
            let cache = RedisCache::connect(url).await?;
            let resilience = Resilience::new(
                "session-cache",
                CircuitBreakerConfig::default(),
                RetryPolicy::default(),
            );
            Arc::new(DistributedSessionStore::new(
                cache,
                config.session_key_prefix.clone(),
                config.session_ttl,
                resilience,
            ))
        }
    };

    let hub = Arc::new(NotificationHub::new());
    let tracker = Arc::new(ProgressTracker::new(hub.clone(), config.progress_stale_after));
    tracker.spawn_sweeper(config.progress_sweep_interval);

    let runtime = Arc::new(RuntimeProvider::new(sessions.clone(), tracker));
    let tools = ToolRegistry::build(&[runtime.clone() as Arc<dyn ToolProvider>])?;
    let resources = ResourceRegistry::build(&[runtime.clone() as Arc<dyn ResourceProvider>])?;
    let prompts = PromptRegistry::build(&[runtime as Arc<dyn PromptProvider>])?;

    let mut dispatcher = Dispatcher::new(tools, resources, prompts);
    if config.rate_limit_capacity > 0 {
        dispatcher = dispatcher.with_rate_limiter(Arc::new(TokenBucket::new(
            config.rate_limit_capacity,
            config.rate_limit_refill_per_sec,
        )));
    }
    if let Some(timeout) = config.tool_timeout {
        dispatcher = dispatcher.with_call_timeout(timeout);
    }

    let state = AppState::new(config.api_token.clone(), sessions, hub, dispatcher);
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        session_backend = match config.session_backend {
            SessionBackend::Local => "local",
            SessionBackend::Redis { .. } => "redis",
        },
        auth = config.api_token.is_some(),
        "server starting"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
