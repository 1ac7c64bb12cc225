use std::sync::Arc;
use std::time::Duration;

use tokenpool::{
    allocator::Allocator,
    config::AppConfig,
    db::Db,
    events::EventBus,
    logger::init_tracing,
    metrics::Counters,
    queue::{DelayedReleaseQueue, ExponentialBackoffRetry},
    seed,
    token::cache::StateCache,
    token::repository::TokenRepository,
    token::repository_pg::PgTokenRepository,
};

/// Connects to the database, runs migrations, constructs the repository
/// and tops the pool up to its configured size. Returns the repository
/// alongside the raw pool so the queue can share the same connections.
async fn init_repo(cfg: &AppConfig) -> anyhow::Result<(Arc<dyn TokenRepository>, sqlx::PgPool)> {
    let db = Db::connect(&cfg.database_url, cfg.pool_max_connections).await?;
    db.migrate().await?;

    let pool = (*db.pool).clone();
    let repo: Arc<dyn TokenRepository> = Arc::new(PgTokenRepository::new(pool.clone()));

    let created = seed::top_up(repo.as_ref(), cfg.pool_size).await?;
    if created > 0 {
        tracing::info!(created, "seeded fresh token pool");
    }

    Ok((repo, pool))
}

/// Starts the reconciler loop: a fixed-interval full `reload()` of the
/// StateCache from the repository, correcting any drift that a targeted
/// `upsert` missed (e.g. a process crash between commit and cache
/// update).
fn start_reconciler(cache: Arc<StateCache>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = cache.reload().await {
                tracing::error!(error = %e, "reconciler reload failed");
            }
        }
    });
}

fn start_queue_worker(queue: Arc<DelayedReleaseQueue>, allocator: Arc<Allocator>, interval: Duration) {
    tokio::spawn(async move {
        queue.run_forever(allocator.as_ref(), interval).await;
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("Starting tokenpool allocator...");

    let cfg = AppConfig::from_env();

    let (repo, pool) = init_repo(&cfg).await?;

    let events = Arc::new(EventBus::default());
    let cache = Arc::new(StateCache::new(repo.clone(), events.clone()));
    cache.reload().await?;

    let backoff = ExponentialBackoffRetry {
        base_delay_ms: cfg.queue_backoff_base_ms,
        max_retries: cfg.queue_max_attempts,
        backoff_multiplier: cfg.queue_backoff_multiplier,
        max_delay_ms: cfg.queue_backoff_max_ms,
    };
    let queue = Arc::new(DelayedReleaseQueue::new(pool, backoff));

    let allocator = Arc::new(Allocator::new(
        repo,
        cache.clone(),
        events,
        queue.clone(),
        chrono::Duration::milliseconds(cfg.activation_ttl_ms as i64),
        Counters::default(),
    ));

    start_queue_worker(
        queue,
        allocator.clone(),
        Duration::from_millis(cfg.queue_poll_interval_ms),
    );
    start_reconciler(cache, Duration::from_millis(cfg.reconcile_interval_ms));

    tracing::info!("tokenpool started; waiting for shutdown signal");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    Ok(())
}
