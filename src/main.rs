use std::sync::Arc;

use ai_queue::config::DispatcherConfig;
use ai_queue::handlers::register_default_handlers;
use ai_queue::limiter::TokenBucket;
use ai_queue::queue::{Dispatcher, HandlerRegistry};
use ai_queue::store::{JobStore, LibSqlJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DispatcherConfig::from_env();
    config.validate()?;

    let enabled = std::env::var("ENABLE_AI_QUEUE")
        .map(|v| v == "true")
        .unwrap_or(false);

    eprintln!("🧠 AI Queue v{}", env!("CARGO_PKG_VERSION"));

    if !enabled {
        eprintln!("   Dispatcher skipped. Set ENABLE_AI_QUEUE=true to enable.");
        return Ok(());
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("AI_QUEUE_DB_PATH").unwrap_or_else(|_| "./data/ai-queue.db".to_string());
    let store: Arc<dyn JobStore> =
        Arc::new(LibSqlJobStore::new_local(std::path::Path::new(&db_path)).await?);
    eprintln!("   Database: {}", db_path);

    // ── Rate limiter ─────────────────────────────────────────────────────
    let limiter = Arc::new(TokenBucket::new(config.rate_capacity, config.refill_rate()));
    eprintln!(
        "   Token bucket: {:.0} units, {:.2} units/sec",
        limiter.capacity(),
        limiter.refill_rate()
    );

    // ── Handlers ─────────────────────────────────────────────────────────
    let handlers = Arc::new(HandlerRegistry::new());
    register_default_handlers(&handlers);
    eprintln!("   Handlers: {} registered", handlers.count());

    match config.reclaim_after {
        Some(after) => eprintln!("   Stale reclaim: after {}s", after.as_secs()),
        None => eprintln!("   Stale reclaim: disabled (processing jobs survive restarts)"),
    }

    eprintln!(
        "   Polling every {:?}, batch {}, max attempts {}, backoff {:?}\n",
        config.poll_interval, config.batch_size, config.max_attempts, config.retry_backoff
    );

    let dispatcher = Arc::new(Dispatcher::new(config, store, limiter, handlers)?);
    let handle = dispatcher.spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    handle.stop().await;

    Ok(())
}
