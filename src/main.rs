use std::sync::Arc;

use clap::Parser;

use flowgate::balancer::Balancer;
use flowgate::config::Config;
use flowgate::health::{HealthLoop, HttpHealthChecker};
use flowgate::proxy::Proxy;
use flowgate::ratelimit::{ClientManager, TokenBucketRateLimiter};
use flowgate::server::{AppState, Server};
use flowgate::storage::{MemoryStorage, RedisStorage, Storage};

/// flowgate — HTTP reverse-proxy load balancer
#[derive(Parser)]
#[command(name = "flowgate", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    flowgate::logging::init(&config.logging)?;

    tracing::info!("flowgate v{}", env!("CARGO_PKG_VERSION"));

    let balancer = Arc::new(Balancer::from_config(&config)?);

    let mut storage: Option<Arc<dyn Storage>> = None;
    let mut rate_limiter: Option<Arc<TokenBucketRateLimiter>> = None;
    let mut client_manager: Option<Arc<ClientManager>> = None;

    if config.rate_limit.enabled {
        let store: Arc<dyn Storage> = if config.rate_limit.redis.addr.is_empty() {
            tracing::info!("Using in-process rate limit storage");
            Arc::new(MemoryStorage::new())
        } else {
            Arc::new(RedisStorage::connect(&config.rate_limit.redis).await?)
        };

        let limiter =
            Arc::new(TokenBucketRateLimiter::new(store.clone(), &config.rate_limit).await?);
        client_manager = Some(Arc::new(ClientManager::new(
            store.clone(),
            limiter.clone(),
            &config.rate_limit,
        )));
        rate_limiter = Some(limiter);
        storage = Some(store);
    } else {
        tracing::info!("Rate limiting is disabled");
    }

    let health_handle = if config.health_check.enabled {
        let checker = Arc::new(HttpHealthChecker::new(&config.health_check));
        Some(HealthLoop::new(balancer.clone(), checker, &config.health_check).spawn())
    } else {
        tracing::info!("Health checks are disabled");
        None
    };

    let proxy = Arc::new(Proxy::new(
        balancer.clone(),
        rate_limiter.clone(),
        &config.server,
    ));

    let server = Server::new(
        config.server.clone(),
        AppState {
            balancer,
            proxy,
            clients: client_manager,
        },
    );
    server.run().await?;

    // Stop background work before releasing the stores
    if let Some(handle) = health_handle {
        handle.abort();
    }
    if let Some(limiter) = rate_limiter {
        if let Err(e) = limiter.close().await {
            tracing::error!(error = %e, "Rate limiter close error");
        }
    }
    if let Some(store) = storage {
        if let Err(e) = store.close().await {
            tracing::error!(error = %e, "Storage close error");
        }
    }

    tracing::info!("Server gracefully stopped");
    Ok(())
}
