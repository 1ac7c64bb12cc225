use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration as StdDuration;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, QueueError};
use crate::events::{EventBus, TokenEvent};
use crate::logger::warn_if_slow;
use crate::metrics::Counters;
use crate::queue::DelayedReleaseQueue;
use crate::time;
use crate::token::cache::StateCache;
use crate::token::model::{ClearResult, PoolStats, Token};
use crate::token::repository::{ExpireOutcome, ReleaseOutcome, TokenHistory, TokenRepository};

/// The orchestrator tying the Repository, DelayedReleaseQueue,
/// StateCache and EventBus together. Each public method here is a thin
/// wrapper: the repository call is the single source of truth and the
/// only thing that can fail the operation; everything after it
/// (scheduling the release job, updating the cache, publishing an
/// event) is a best-effort side effect that never unwinds a committed
/// change back into an error the caller has to handle.
pub struct Allocator {
    repo: Arc<dyn TokenRepository>,
    cache: Arc<StateCache>,
    events: Arc<EventBus>,
    queue: Arc<DelayedReleaseQueue>,
    ttl: chrono::Duration,
    counters: Counters,
}

impl Allocator {
    pub fn new(
        repo: Arc<dyn TokenRepository>,
        cache: Arc<StateCache>,
        events: Arc<EventBus>,
        queue: Arc<DelayedReleaseQueue>,
        ttl: chrono::Duration,
        counters: Counters,
    ) -> Self {
        Self {
            repo,
            cache,
            events,
            queue,
            ttl,
            counters,
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    /// Assigns the caller a token: an available one if the pool has
    /// room, or the oldest still-active one if the pool is saturated.
    /// Rejects a user that already holds an active token.
    #[instrument(skip(self), target = "allocator", fields(user_id = %user_id))]
    pub async fn activate(&self, user_id: Uuid) -> Result<Token, AppError> {
        let now = time::now();

        let outcome = warn_if_slow(
            "repo_try_activate",
            StdDuration::from_millis(100),
            self.repo.try_activate(user_id, now, self.ttl),
        )
        .await;

        let outcome = match outcome {
            Ok(o) => o,
            Err(AppError::AlreadyHasActiveToken) => {
                self.counters
                    .rejected_already_active
                    .fetch_add(1, Ordering::Relaxed);
                return Err(AppError::AlreadyHasActiveToken);
            }
            Err(AppError::NoTokensAvailable) => {
                self.counters
                    .rejected_no_tokens
                    .fetch_add(1, Ordering::Relaxed);
                return Err(AppError::NoTokensAvailable);
            }
            Err(e) => return Err(e),
        };

        self.cache.upsert(outcome.token.clone());

        if let Some(preempted_user_id) = outcome.preempted_user_id {
            self.counters.preemptions.fetch_add(1, Ordering::Relaxed);
            info!(
                token_id = %outcome.token.id,
                %preempted_user_id,
                "preempted oldest active token"
            );
        }
        self.counters.activations.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self
            .queue
            .schedule(outcome.token.id, outcome.token.expires_at(self.ttl))
            .await
        {
            // The token is correctly activated in the database regardless;
            // losing the scheduled release just means it falls to the
            // reconciler to notice an overdue activation on its next sweep.
            warn!(token_id = %outcome.token.id, error = %e, "failed to schedule delayed release");
        }

        self.events.publish(TokenEvent::Activated {
            token_id: outcome.token.id,
            user_id,
            activated_at: now,
        });

        Ok(outcome.token)
    }

    /// Releases a token back to the pool. Idempotent: releasing an
    /// already-available token succeeds without effect.
    #[instrument(skip(self), target = "allocator", fields(token_id = %token_id))]
    pub async fn release(&self, token_id: Uuid) -> Result<(), AppError> {
        let now = time::now();
        let outcome = self.repo.release_token(token_id, now).await?;

        if outcome == ReleaseOutcome::Released {
            self.refresh_cache_entry(token_id).await?;
            self.counters.releases.fetch_add(1, Ordering::Relaxed);
            self.events.publish(TokenEvent::Released {
                token_id,
                released_at: now,
            });
        }

        Ok(())
    }

    /// Forces every active token back to available. Always succeeds.
    #[instrument(skip(self), target = "allocator")]
    pub async fn clear_active(&self) -> Result<ClearResult, AppError> {
        let now = time::now();
        let result = self.repo.clear_all_active(now).await?;

        self.cache.bulk_mark_available(&result.reset_token_ids);
        self.counters.clears.fetch_add(1, Ordering::Relaxed);

        for &token_id in &result.reset_token_ids {
            self.events.publish(TokenEvent::Released {
                token_id,
                released_at: now,
            });
        }

        info!(
            tokens_reset = result.tokens_reset,
            usages_closed = result.usages_closed,
            "cleared all active tokens"
        );

        Ok(result)
    }

    /// Called by the DelayedReleaseQueue worker for a due job. Releases
    /// the token only if it is still on the same activation the job was
    /// scheduled against; anything else (already released, reactivated
    /// since) is a successful no-op.
    #[instrument(skip(self), target = "allocator", fields(token_id = %token_id))]
    pub async fn expire_if_due(&self, token_id: Uuid) -> Result<(), QueueError> {
        let now = time::now();
        let outcome = self.repo.expire_if_due(token_id, now, self.ttl).await?;

        match outcome {
            ExpireOutcome::Released => {
                self.refresh_cache_entry(token_id).await?;
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                self.events.publish(TokenEvent::Released {
                    token_id,
                    released_at: now,
                });
                Ok(())
            }
            ExpireOutcome::NotExpired => Err(QueueError::NotExpired),
        }
    }

    pub async fn get_token(&self, token_id: Uuid) -> Result<Option<Token>, AppError> {
        self.repo.get_token(token_id).await
    }

    pub async fn get_token_history(&self, token_id: Uuid) -> Result<Option<TokenHistory>, AppError> {
        self.repo.get_token_history(token_id).await
    }

    pub async fn get_user_active_token(&self, user_id: Uuid) -> Result<Option<Token>, AppError> {
        self.repo.get_user_active_token(user_id).await
    }

    pub fn stats(&self) -> PoolStats {
        self.cache.stats()
    }

    async fn refresh_cache_entry(&self, token_id: Uuid) -> Result<(), AppError> {
        if let Some(token) = self.repo.get_token(token_id).await? {
            self.cache.upsert(token);
        }
        Ok(())
    }
}
