use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::allocator::Allocator;
use crate::error::QueueError;

/// Exponential backoff used to space out retried release attempts.
/// Mirrors the shape used elsewhere in the ecosystem for transient-error
/// retry: `delay(attempt) = min(base * multiplier^attempt, cap)`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    pub base_delay_ms: u64,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl ExponentialBackoffRetry {
    pub fn new(base_delay_ms: u64, max_retries: u32, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_retries,
            backoff_multiplier: 2.0,
            max_delay_ms,
        }
    }

    pub fn delay(&self, attempt: u32) -> chrono::Duration {
        let delay_ms =
            (self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32)) as u64;
        chrono::Duration::milliseconds(delay_ms.min(self.max_delay_ms) as i64)
    }
}

/// Durable, PostgreSQL-backed job queue standing in for an in-process
/// timer: a successful `activate` schedules exactly one row here, and a
/// worker loop claims rows whose `run_at` has passed and asks the
/// Allocator to release them if they're still due.
///
/// Claiming uses `FOR UPDATE SKIP LOCKED` so multiple worker instances
/// can run against the same table without contending on the same row.
pub struct DelayedReleaseQueue {
    pool: PgPool,
    backoff: ExponentialBackoffRetry,
}

impl DelayedReleaseQueue {
    pub fn new(pool: PgPool, backoff: ExponentialBackoffRetry) -> Self {
        Self { pool, backoff }
    }

    /// Schedules (or reschedules) a release attempt for `token_id` at
    /// `run_at`. A fresh activation always supersedes any still-pending
    /// job for the same token — hence the upsert, with `attempts` reset
    /// to zero: the previous activation's retry history is irrelevant to
    /// the new one.
    #[instrument(skip(self), target = "queue", fields(token_id = %token_id))]
    pub async fn schedule(&self, token_id: Uuid, run_at: DateTime<Utc>) -> Result<(), QueueError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO delayed_release_jobs \
             (token_id, run_at, attempts, status, last_error, created_at, updated_at) \
             VALUES ($1, $2, 0, 'pending', NULL, $3, $3) \
             ON CONFLICT (token_id) DO UPDATE SET \
               run_at = excluded.run_at, attempts = 0, status = 'pending', \
               last_error = NULL, updated_at = excluded.updated_at",
        )
        .bind(token_id)
        .bind(run_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::ScheduleFailed(e.to_string()))?;

        debug!(%run_at, "delayed release scheduled");
        Ok(())
    }

    /// Claims and processes a single due job, if one exists. Returns
    /// `Ok(true)` if a job was claimed (whether or not the release it
    /// asked for actually did anything), `Ok(false)` if none were due.
    #[instrument(skip(self, allocator), target = "queue")]
    pub async fn process_next(&self, allocator: &Allocator) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            QueueError::ScheduleFailed(format!("failed to begin queue transaction: {e}"))
        })?;

        let row = sqlx::query(
            "SELECT token_id, attempts FROM delayed_release_jobs \
             WHERE status = 'pending' AND run_at <= $1 \
             ORDER BY run_at ASC FOR UPDATE SKIP LOCKED LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| QueueError::ScheduleFailed(e.to_string()))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| QueueError::ScheduleFailed(e.to_string()))?;
            return Ok(false);
        };

        let token_id: Uuid = row.get("token_id");
        let attempts: i32 = row.get("attempts");

        sqlx::query("DELETE FROM delayed_release_jobs WHERE token_id = $1")
            .bind(token_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::ScheduleFailed(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| QueueError::ScheduleFailed(e.to_string()))?;

        match allocator.expire_if_due(token_id).await {
            Ok(_) => {
                info!(%token_id, "delayed release job completed");
            }
            // Per spec.md §4.3/§4.2: the token was already released, its
            // usage already closed, or this activation has since been
            // superseded by a newer one with its own fresh job. All three
            // are a completed no-op, not a failure — requeuing here would
            // both retry work that's already done and risk clobbering a
            // legitimate job a concurrent `schedule()` wrote for this same
            // token_id after this job's row was deleted above.
            Err(QueueError::NotExpired) => {
                debug!(%token_id, "delayed release job not due; treating as complete");
            }
            Err(e) => {
                warn!(%token_id, error = %e, attempts, "delayed release attempt failed");
                self.requeue_or_fail(token_id, attempts as u32, &e.to_string())
                    .await?;
            }
        }

        Ok(true)
    }

    async fn requeue_or_fail(
        &self,
        token_id: Uuid,
        attempts: u32,
        last_error: &str,
    ) -> Result<(), QueueError> {
        let next_attempt = attempts + 1;
        let now = Utc::now();

        if next_attempt > self.backoff.max_retries {
            error!(%token_id, attempts = next_attempt, "delayed release job exhausted retries");
            sqlx::query(
                "INSERT INTO delayed_release_jobs \
                 (token_id, run_at, attempts, status, last_error, created_at, updated_at) \
                 VALUES ($1, $2, $3, 'failed', $4, $2, $2) \
                 ON CONFLICT (token_id) DO UPDATE SET \
                   run_at = excluded.run_at, attempts = excluded.attempts, \
                   status = 'failed', last_error = excluded.last_error, \
                   updated_at = excluded.updated_at",
            )
            .bind(token_id)
            .bind(now)
            .bind(next_attempt as i32)
            .bind(last_error)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::ScheduleFailed(e.to_string()))?;
            return Ok(());
        }

        let run_at = now + self.backoff.delay(attempts);
        sqlx::query(
            "INSERT INTO delayed_release_jobs \
             (token_id, run_at, attempts, status, last_error, created_at, updated_at) \
             VALUES ($1, $2, $3, 'pending', $4, $2, $2) \
             ON CONFLICT (token_id) DO UPDATE SET \
               run_at = excluded.run_at, attempts = excluded.attempts, \
               status = 'pending', last_error = excluded.last_error, \
               updated_at = excluded.updated_at",
        )
        .bind(token_id)
        .bind(run_at)
        .bind(next_attempt as i32)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::ScheduleFailed(e.to_string()))?;

        Ok(())
    }

    /// Polls for due jobs on a fixed interval until the process shuts
    /// down. Intended to be spawned once per process; multiple workers
    /// across processes are safe thanks to `SKIP LOCKED`.
    pub async fn run_forever(&self, allocator: &Allocator, poll_interval: StdDuration) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            loop {
                match self.process_next(allocator).await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!(error = %e, "queue worker tick failed");
                        break;
                    }
                }
            }
        }
    }
}
