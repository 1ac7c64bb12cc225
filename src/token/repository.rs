use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::token::model::{ClearResult, Token, TokenUsage};

/// History for a single token, newest usage first — including the
/// currently open one, if any. Source behavior (see SPEC_FULL.md §10)
/// returns open usages too; we preserve that rather than filtering them.
#[derive(Clone, Debug)]
pub struct TokenHistory {
    pub token: Token,
    pub usages: Vec<TokenUsage>,
}

/// What `try_activate` did, for the Allocator to react to post-commit.
#[derive(Clone, Debug)]
pub struct ActivationOutcome {
    pub token: Token,
    pub usage: TokenUsage,
    /// Set when this activation preempted another user's token.
    pub preempted_user_id: Option<Uuid>,
}

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The token was active and is now available.
    Released,
    /// The token was already available; releasing it was a no-op.
    AlreadyAvailable,
}

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    /// The due job matched a still-open activation and released it.
    Released,
    /// The token was already available, or the usage the job targeted had
    /// already closed, or the activation has been superseded by a newer
    /// one — in all three cases this is success-as-no-op.
    NotExpired,
}

/// The durable record's query layer. Every method here is a single
/// self-contained unit of work — it opens (and commits or rolls back) its
/// own transaction internally, so from the Allocator's point of view each
/// call is atomic. This keeps the trait object-safe (`Arc<dyn
/// TokenRepository>` is usable both by the Allocator and, read-only, by
/// the StateCache reconciler) while the row-locking discipline spec.md
/// §4.1 requires (`SELECT ... FOR UPDATE SKIP LOCKED`, `FOR UPDATE ORDER
/// BY activated_at ASC, id ASC`) lives entirely inside the PostgreSQL
/// implementation, where it belongs.
#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn count_total(&self) -> Result<i64, AppError>;
    async fn count_active(&self) -> Result<i64, AppError>;
    async fn count_open_usages(&self) -> Result<i64, AppError>;

    async fn list_tokens(&self) -> Result<Vec<Token>, AppError>;

    async fn get_token(&self, id: Uuid) -> Result<Option<Token>, AppError>;

    async fn get_token_history(&self, id: Uuid) -> Result<Option<TokenHistory>, AppError>;

    async fn get_user_active_token(&self, user_id: Uuid) -> Result<Option<Token>, AppError>;

    /// Implements spec.md §4.2 `activate` steps 1–7 as one transaction:
    /// reject a second active token for the same user, pick an available
    /// token (skip-locked) or preempt the oldest active one on
    /// saturation, transition it to active, and open a new usage. Returns
    /// `Err(AppError::AlreadyHasActiveToken)` /
    /// `Err(AppError::NoTokensAvailable)` per the documented error
    /// mapping; never returns `Ok` without having committed.
    async fn try_activate(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<ActivationOutcome, AppError>;

    /// Implements spec.md §4.2 `release`: closes the open usage (if any)
    /// and marks the token available, in one transaction. Idempotent.
    async fn release_token(
        &self,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, AppError>;

    /// Implements spec.md §4.2 `clearActive`: one transaction, always
    /// succeeds.
    async fn clear_all_active(&self, now: DateTime<Utc>) -> Result<ClearResult, AppError>;

    /// Implements spec.md §4.2 `expireIfDue`: releases the token only if
    /// it is still active on the same activation epoch (`activated_at`)
    /// the queue job was scheduled against, and only once `now >=
    /// activated_at + ttl`.
    async fn expire_if_due(
        &self,
        token_id: Uuid,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<ExpireOutcome, AppError>;

    /// Inserts a token row directly as available. Used only by seeding
    /// (the external collaborator), exposed here because the Repository
    /// is the only component with a connection to the Store.
    async fn insert_available_token(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), AppError>;
}
