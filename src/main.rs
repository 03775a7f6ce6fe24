use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use gatecrab::admin::{format_pool_status, format_registry_stats};
use gatecrab::{ClientIdRegistry, Config, ConnectionPool, PoolMetrics, TcpTransportFactory};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const APP_NAME: &str = "🦀 gatecrab";

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> std::io::Result<()> {
    setup().await;
    run_until_shutdown().await
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

async fn setup() {
    // This has to be the first thing we do, because it initializes the config
    Config::init().await;

    init_tracing();
}

fn init_tracing() {
    let config = Config::snapshot();
    let filter = EnvFilter::try_new(config.log_level.as_str())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

// -----------------------------------------------------------------------------
// ----- Run -------------------------------------------------------------------

async fn run_until_shutdown() -> std::io::Result<()> {
    let config = Config::snapshot();

    let registry = Arc::new(ClientIdRegistry::new(config.limits.clone(), &config.registry));
    let metrics = Arc::new(PoolMetrics::new());
    let pool = ConnectionPool::new(
        TcpTransportFactory::default(),
        registry.clone(),
        config.gateway.clone(),
        config.pool.clone(),
        metrics.clone(),
    );

    pool.start();
    info!("{} managing sessions for {}", APP_NAME, config.gateway.addr());
    info!("registry:\n{}", format_registry_stats(&registry.stats()));

    let mut report = tokio::time::interval(config.pool.health_check_interval);
    report.tick().await;

    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("failed to listen for shutdown signal: {e}");
                }
                info!("{} shutting down", APP_NAME);
                break;
            }

            _ = report.tick() => {
                info!("pool:\n{}", format_pool_status(&pool.status()));
                info!(metrics = ?metrics.snapshot(), "pool metrics");
            }
        }
    }

    pool.stop().await;
    if let Err(e) = registry.save() {
        warn!("final registry save skipped: {e}");
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
