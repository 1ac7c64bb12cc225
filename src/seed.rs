use uuid::Uuid;

use crate::error::AppError;
use crate::time;
use crate::token::repository::TokenRepository;

/// Tops the pool up to `target_size` available tokens on startup. Purely
/// ambient bootstrapping, not part of the allocator's own algorithms: a
/// production deployment seeds this table once, out of band, and this
/// only exists so a fresh database is usable without a separate step.
pub async fn top_up(repo: &dyn TokenRepository, target_size: usize) -> Result<usize, AppError> {
    let existing = repo.count_total().await? as usize;
    let missing = target_size.saturating_sub(existing);

    for _ in 0..missing {
        repo.insert_available_token(Uuid::new_v4(), time::now())
            .await?;
    }

    Ok(missing)
}
