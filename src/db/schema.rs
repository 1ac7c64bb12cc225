use sqlx::PgPool;

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    // Tokens: the fixed pool of 100 allocation slots. `status` and
    // `current_user_id`/`activated_at` are kept in lockstep by the
    // repository; the partial unique index is the database's half of
    // that guarantee — it is what actually enforces "one active token
    // per user" under concurrent activation attempts.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS tokens (
  id UUID PRIMARY KEY,
  status TEXT NOT NULL,
  current_user_id UUID,
  activated_at TIMESTAMPTZ,
  created_at TIMESTAMPTZ NOT NULL,
  updated_at TIMESTAMPTZ NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_one_active_per_user
  ON tokens(current_user_id)
  WHERE status = 'active';
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_tokens_status ON tokens(status);"#)
        .execute(pool)
        .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_tokens_status_activated_at ON tokens(status, activated_at);"#,
    )
    .execute(pool)
    .await?;

    // Token usages: one row per activation epoch. Closed usages are
    // immutable; `ended_at` is the only column ever updated post-insert.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS token_usages (
  id UUID PRIMARY KEY,
  token_id UUID NOT NULL REFERENCES tokens(id) ON DELETE CASCADE,
  user_id UUID NOT NULL,
  started_at TIMESTAMPTZ NOT NULL,
  ended_at TIMESTAMPTZ,
  created_at TIMESTAMPTZ NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_usages_token ON token_usages(token_id);"#)
        .execute(pool)
        .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_usages_user ON token_usages(user_id);"#)
        .execute(pool)
        .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_usages_started_at ON token_usages(started_at);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_usages_token_open ON token_usages(token_id, ended_at);"#,
    )
    .execute(pool)
    .await?;

    // Delayed release jobs: the durable backing store for the
    // DelayedReleaseQueue. One row per token; a fresh `schedule()` call
    // upserts over any still-pending row for the same token rather than
    // accumulating duplicates.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS delayed_release_jobs (
  token_id UUID PRIMARY KEY REFERENCES tokens(id) ON DELETE CASCADE,
  run_at TIMESTAMPTZ NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  status TEXT NOT NULL DEFAULT 'pending',
  last_error TEXT,
  created_at TIMESTAMPTZ NOT NULL,
  updated_at TIMESTAMPTZ NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_jobs_status_run_at ON delayed_release_jobs(status, run_at);"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
