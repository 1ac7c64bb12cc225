use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::AppError;
use crate::token::model::{ClearResult, Token, TokenStatus, TokenUsage};
use crate::token::repository::{
    ActivationOutcome, ExpireOutcome, ReleaseOutcome, TokenHistory, TokenRepository,
};

/// PostgreSQL-backed implementation of TokenRepository. Responsible only
/// for persistence, row locking and row mapping; the Allocator decides
/// what the outcomes mean.
pub struct PgTokenRepository {
    pool: PgPool,
}

impl PgTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Postgres' unique-violation SQLSTATE. Used to translate a racing
/// second activation attempt for the same user into
/// `AppError::AlreadyHasActiveToken` instead of a raw database error.
const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().and_then(|e| e.code()),
        Some(code) if code == UNIQUE_VIOLATION
    )
}

#[async_trait]
impl TokenRepository for PgTokenRepository {
    async fn count_total(&self) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tokens")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn count_active(&self) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tokens WHERE status = 'active'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn count_open_usages(&self) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM token_usages WHERE ended_at IS NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn list_tokens(&self) -> Result<Vec<Token>, AppError> {
        let rows = sqlx::query("SELECT * FROM tokens ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_token).collect()
    }

    async fn get_token(&self, id: Uuid) -> Result<Option<Token>, AppError> {
        let row = sqlx::query("SELECT * FROM tokens WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_token).transpose()
    }

    async fn get_token_history(&self, id: Uuid) -> Result<Option<TokenHistory>, AppError> {
        let Some(token) = self.get_token(id).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT * FROM token_usages WHERE token_id = $1 ORDER BY started_at DESC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let usages = rows.iter().map(row_to_usage).collect::<Result<_, _>>()?;
        Ok(Some(TokenHistory { token, usages }))
    }

    async fn get_user_active_token(&self, user_id: Uuid) -> Result<Option<Token>, AppError> {
        let row = sqlx::query(
            "SELECT * FROM tokens WHERE current_user_id = $1 AND status = 'active'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_token).transpose()
    }

    async fn try_activate(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<ActivationOutcome, AppError> {
        let _ = ttl; // TTL governs expiry, not activation; kept for signature symmetry.
        let mut tx = self.pool.begin().await?;

        let already_active = sqlx::query(
            "SELECT 1 FROM tokens WHERE current_user_id = $1 AND status = 'active'",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if already_active.is_some() {
            tx.rollback().await?;
            return Err(AppError::AlreadyHasActiveToken);
        }

        let available = sqlx::query(
            "SELECT id FROM tokens WHERE status = 'available' \
             FOR UPDATE SKIP LOCKED LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let result = if let Some(row) = available {
            let token_id: Uuid = row.get("id");
            activate_fresh(&mut tx, token_id, user_id, now).await
        } else {
            let victim = sqlx::query(
                "SELECT id, current_user_id FROM tokens WHERE status = 'active' \
                 ORDER BY activated_at ASC, id ASC LIMIT 1 FOR UPDATE",
            )
            .fetch_optional(&mut *tx)
            .await?;

            match victim {
                Some(row) => {
                    let token_id: Uuid = row.get("id");
                    let preempted_user_id: Uuid = row.get("current_user_id");
                    preempt_and_activate(&mut tx, token_id, preempted_user_id, user_id, now).await
                }
                None => Err(AppError::NoTokensAvailable),
            }
        };

        match result {
            Ok(outcome) => {
                commit_or_translate(tx).await?;
                Ok(outcome)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(translate_activation_conflict(e))
            }
        }
    }

    async fn release_token(
        &self,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM tokens WHERE id = $1 FOR UPDATE")
            .bind(token_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(AppError::TokenNotFound(token_id));
        };

        let status: String = row.get("status");
        if status != "active" {
            tx.commit().await?;
            return Ok(ReleaseOutcome::AlreadyAvailable);
        }

        close_open_usage(&mut tx, token_id, now).await?;
        mark_available(&mut tx, token_id, now).await?;

        tx.commit().await?;
        Ok(ReleaseOutcome::Released)
    }

    async fn clear_all_active(&self, now: DateTime<Utc>) -> Result<ClearResult, AppError> {
        let mut tx = self.pool.begin().await?;

        let closed = sqlx::query(
            "UPDATE token_usages SET ended_at = $1 WHERE ended_at IS NULL",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let reset_rows = sqlx::query(
            "UPDATE tokens SET status = 'available', current_user_id = NULL, \
             activated_at = NULL, updated_at = $1 WHERE status = 'active' RETURNING id",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let reset_token_ids: Vec<Uuid> = reset_rows.iter().map(|r| r.get("id")).collect();

        Ok(ClearResult {
            tokens_reset: reset_token_ids.len() as u32,
            usages_closed: closed.rows_affected() as u32,
            reset_token_ids,
        })
    }

    async fn expire_if_due(
        &self,
        token_id: Uuid,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<ExpireOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT status, activated_at FROM tokens WHERE id = $1 FOR UPDATE",
        )
        .bind(token_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(AppError::TokenNotFound(token_id));
        };

        let status: String = row.get("status");
        if status != "active" {
            tx.commit().await?;
            return Ok(ExpireOutcome::NotExpired);
        }

        let activated_at: Option<DateTime<Utc>> = row.get("activated_at");
        let Some(activated_at) = activated_at else {
            tx.commit().await?;
            return Ok(ExpireOutcome::NotExpired);
        };

        if now < activated_at + ttl {
            tx.commit().await?;
            return Ok(ExpireOutcome::NotExpired);
        }

        close_open_usage(&mut tx, token_id, now).await?;
        mark_available(&mut tx, token_id, now).await?;

        tx.commit().await?;
        Ok(ExpireOutcome::Released)
    }

    async fn insert_available_token(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO tokens (id, status, current_user_id, activated_at, created_at, updated_at) \
             VALUES ($1, 'available', NULL, NULL, $2, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn activate_fresh(
    tx: &mut Transaction<'_, Postgres>,
    token_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ActivationOutcome, AppError> {
    sqlx::query(
        "UPDATE tokens SET status = 'active', current_user_id = $1, activated_at = $2, \
         updated_at = $2 WHERE id = $3",
    )
    .bind(user_id)
    .bind(now)
    .bind(token_id)
    .execute(&mut **tx)
    .await?;

    let usage = insert_usage(tx, token_id, user_id, now).await?;
    let token = fetch_token_locked(tx, token_id).await?;

    Ok(ActivationOutcome {
        token,
        usage,
        preempted_user_id: None,
    })
}

async fn preempt_and_activate(
    tx: &mut Transaction<'_, Postgres>,
    token_id: Uuid,
    preempted_user_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ActivationOutcome, AppError> {
    close_open_usage(tx, token_id, now).await?;

    sqlx::query(
        "UPDATE tokens SET current_user_id = $1, activated_at = $2, updated_at = $2 \
         WHERE id = $3",
    )
    .bind(user_id)
    .bind(now)
    .bind(token_id)
    .execute(&mut **tx)
    .await?;

    let usage = insert_usage(tx, token_id, user_id, now).await?;
    let token = fetch_token_locked(tx, token_id).await?;

    Ok(ActivationOutcome {
        token,
        usage,
        preempted_user_id: Some(preempted_user_id),
    })
}

async fn insert_usage(
    tx: &mut Transaction<'_, Postgres>,
    token_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<TokenUsage, AppError> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO token_usages (id, token_id, user_id, started_at, ended_at, created_at) \
         VALUES ($1, $2, $3, $4, NULL, $4)",
    )
    .bind(id)
    .bind(token_id)
    .bind(user_id)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(TokenUsage {
        id,
        token_id,
        user_id,
        started_at: now,
        ended_at: None,
        created_at: now,
    })
}

async fn close_open_usage(
    tx: &mut Transaction<'_, Postgres>,
    token_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE token_usages SET ended_at = $1 WHERE token_id = $2 AND ended_at IS NULL",
    )
    .bind(now)
    .bind(token_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn mark_available(
    tx: &mut Transaction<'_, Postgres>,
    token_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE tokens SET status = 'available', current_user_id = NULL, activated_at = NULL, \
         updated_at = $1 WHERE id = $2",
    )
    .bind(now)
    .bind(token_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn fetch_token_locked(
    tx: &mut Transaction<'_, Postgres>,
    token_id: Uuid,
) -> Result<Token, AppError> {
    let row = sqlx::query("SELECT * FROM tokens WHERE id = $1")
        .bind(token_id)
        .fetch_one(&mut **tx)
        .await?;
    row_to_token(&row)
}

/// Second line of defense against a racing second activation for the same
/// user (spec.md §4.2/§7): the partial unique index on `current_user_id`
/// can reject the `UPDATE tokens SET current_user_id = ...` inside
/// `activate_fresh`/`preempt_and_activate` just as well as it can reject
/// the transaction commit, and that failure arrives here as a plain
/// `AppError::DatabaseError` via `?`'s `#[from] sqlx::Error` conversion —
/// translate it the same way `commit_or_translate` does, or it surfaces
/// as a 500 instead of the documented 422.
fn translate_activation_conflict(e: AppError) -> AppError {
    if let AppError::DatabaseError(ref db_err) = e {
        if is_unique_violation(db_err) {
            return AppError::AlreadyHasActiveToken;
        }
    }
    e
}

async fn commit_or_translate(tx: Transaction<'_, Postgres>) -> Result<(), AppError> {
    match tx.commit().await {
        Ok(()) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(AppError::AlreadyHasActiveToken),
        Err(e) => Err(e.into()),
    }
}

fn row_to_token(row: &sqlx::postgres::PgRow) -> Result<Token, AppError> {
    let status_str: String = row.get("status");
    let status = TokenStatus::from_str(&status_str)
        .map_err(|e| AppError::InvalidTokenState(e.to_string()))?;

    Ok(Token {
        id: row.get("id"),
        status,
        current_user_id: row.get("current_user_id"),
        activated_at: row.get("activated_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_usage(row: &sqlx::postgres::PgRow) -> Result<TokenUsage, AppError> {
    Ok(TokenUsage {
        id: row.get("id"),
        token_id: row.get("token_id"),
        user_id: row.get("user_id"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        created_at: row.get("created_at"),
    })
}
