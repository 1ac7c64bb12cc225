#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string.
    pub database_url: String,

    /// Max connections handed to the PostgreSQL pool.
    pub pool_max_connections: u32,

    // =========================
    // Allocator configuration
    // =========================
    /// How long an activation holds a token before it becomes eligible
    /// for automatic release. Fixed at 120s by spec.md, but kept
    /// configurable (not a literal) so tests can run the whole lifecycle
    /// on a compressed clock.
    pub activation_ttl_ms: u64,

    /// Size of the pool. Fixed at 100 by spec.md (I1); kept as a field
    /// rather than a literal so seeding and invariant checks share one
    /// source of truth.
    pub pool_size: usize,

    // =========================
    // DelayedReleaseQueue configuration
    // =========================
    /// How often a queue worker polls the jobs table for due rows.
    pub queue_poll_interval_ms: u64,

    /// Bounded retry attempts before a job is left `failed` (spec.md
    /// §4.3 default: 3).
    pub queue_max_attempts: u32,

    /// Base delay for the queue's exponential backoff.
    pub queue_backoff_base_ms: u64,

    /// Backoff multiplier.
    pub queue_backoff_multiplier: f64,

    /// Cap on the queue's exponential backoff delay.
    pub queue_backoff_max_ms: u64,

    // =========================
    // StateCache configuration
    // =========================
    /// Interval between full `reload()` reconciliation sweeps (spec.md
    /// §4.4 default: 5 minutes).
    pub reconcile_interval_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/tokenpool".to_string());

        Self {
            database_url,
            pool_max_connections: 16,

            activation_ttl_ms: 120_000,
            pool_size: 100,

            queue_poll_interval_ms: 1_000,
            queue_max_attempts: 3,
            queue_backoff_base_ms: 1_000,
            queue_backoff_multiplier: 2.0,
            queue_backoff_max_ms: 30_000,

            reconcile_interval_ms: 5 * 60 * 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literals() {
        // SAFETY_NOTE for the reader: these asserts pin spec.md's fixed
        // constants (120s TTL, pool of 100, 5 min reconcile, 3 retries)
        // even though the fields are configurable.
        std::env::remove_var("DATABASE_URL");
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.activation_ttl_ms, 120_000);
        assert_eq!(cfg.pool_size, 100);
        assert_eq!(cfg.reconcile_interval_ms, 300_000);
        assert_eq!(cfg.queue_max_attempts, 3);
    }
}
