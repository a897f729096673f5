//! Risk Daemon
//!
//! Loads configuration, wires the stores, feed and order router into the
//! risk manager and serves health endpoints until interrupted.

mod health;

use anyhow::{Context, Result};
use clap::Parser;
use options_core::api::{HttpQuoteProvider, WsTickSource};
use options_core::config::AppConfig;
use options_core::db::{self, MemoryPositionStore, PgPositionStore, PositionStore};
use risk_manager::{
    MemoryBackend, RedisBackend, RiskComponents, RiskManager, SnapshotBackend, UnderlyingBoard,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trading_engine::{ExecutorConfig, OrderExecutor};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Debug, Parser)]
#[command(name = "risk-daemon", version, about = "Real-time risk management for open option positions")]
struct Cli {
    /// TOML configuration file. Environment variables prefixed `RISK_` override it.
    #[arg(short, long, default_value = "risk.toml")]
    config: PathBuf,

    /// Skip database migrations on startup.
    #[arg(long)]
    skip_migrations: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "risk_daemon=info,risk_manager=info,trading_engine=info,options_core=warn,tungstenite=warn,hyper=warn".into()
    });
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn position_store(config: &AppConfig, skip_migrations: bool) -> Result<Arc<dyn PositionStore>> {
    let Some(url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set, positions are kept in memory only");
        return Ok(Arc::new(MemoryPositionStore::new()));
    };

    let pool = db::create_pool(url, config.database_max_connections)
        .await
        .context("connecting to PostgreSQL")?;
    if skip_migrations {
        info!("Skipping migrations");
    } else {
        info!("Running database migrations...");
        db::run_migrations(&pool).await?;
    }
    Ok(Arc::new(PgPositionStore::new(pool)))
}

async fn snapshot_backend(config: &AppConfig) -> Result<Arc<dyn SnapshotBackend>> {
    match config.redis_url.as_deref() {
        Some(url) => {
            let backend = RedisBackend::connect(url)
                .await
                .context("connecting to Redis")?;
            Ok(Arc::new(backend))
        }
        None => {
            warn!("REDIS_URL not set, PnL snapshots are process-local");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_tracing();

    info!(config = %cli.config.display(), "Starting risk daemon");
    let config = AppConfig::load(Some(&cli.config)).context("loading configuration")?;

    let store = position_store(&config, cli.skip_migrations).await?;
    let snapshots = snapshot_backend(&config).await?;
    let router = OrderExecutor::new(ExecutorConfig {
        live_trading: config.live_trading,
        broker_url: config.broker_url.clone(),
        api_key: config.broker_api_key.clone(),
        timeout: config.order_timeout(),
        ..ExecutorConfig::default()
    })?;
    let quotes = HttpQuoteProvider::new(config.quote_api_url.clone(), config.quote_timeout())?;
    let feed = WsTickSource::new(config.feed_url.clone())
        .with_keepalive(config.feed_ping_interval(), config.feed_read_timeout());

    let components = RiskComponents {
        store,
        router: Arc::new(router),
        quotes: Arc::new(quotes),
        feed: Arc::new(feed),
        snapshots,
        underlying: Arc::new(UnderlyingBoard::new()),
    };
    let shutdown_timeout = config.risk.shutdown_timeout();
    let manager = Arc::new(RiskManager::new(config.risk.clone(), components)?);
    manager.start().await?;

    let listener = tokio::net::TcpListener::bind(&config.health_addr)
        .await
        .with_context(|| format!("binding {}", config.health_addr))?;
    info!(address = %config.health_addr, "Serving health endpoints");

    axum::serve(listener, health::router(manager.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await?;

    manager.stop(shutdown_timeout).await;
    info!("Risk daemon exited");
    Ok(())
}
