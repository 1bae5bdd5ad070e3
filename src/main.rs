use std::sync::Arc;

use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use relay_llm::gateway::http;
use relay_llm::gateway::limits::AdmissionControl;
use relay_llm::{
    Anthropic, Config, GatewayState, OpenAi, ProviderRegistry, RateLimiter, Router, UsageStore,
};

const REQUEST_DEADLINE_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;

    let store = UsageStore::new(&config.database_url);
    store.init().await?;

    let limiter: Arc<dyn AdmissionControl> =
        match RateLimiter::new(&config.redis_url, config.tokens_per_minute) {
            Ok(limiter) => Arc::new(limiter),
            Err(err) => {
                tracing::warn!(error = %err, "redis not available, rate limiting disabled");
                Arc::new(RateLimiter::disabled())
            }
        };

    let mut registry = ProviderRegistry::new();
    registry.register(
        "openai",
        OpenAi::new(&config.openai.api_key, &config.openai.base_url),
    );
    registry.register(
        "anthropic",
        Anthropic::new(
            &config.anthropic.api_key,
            &config.anthropic.base_url,
            &config.anthropic.version,
        ),
    );

    let state = GatewayState::new(
        Router::new(config.routes.clone()),
        registry,
        store,
        limiter,
    );

    let app = http::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(
            REQUEST_DEADLINE_SECS,
        )));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
