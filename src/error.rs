use thiserror::Error;

/// Domain errors surfaced by the Allocator, per spec.md §7.
///
/// `DatabaseError` is the catch-all for anything the repository didn't
/// translate to a more specific variant; the repository is responsible for
/// recognizing the partial-unique-index violation on `current_user_id`
/// and mapping it to `AlreadyHasActiveToken` before it would otherwise
/// surface as a raw `sqlx::Error`.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("user already holds an active token")]
    AlreadyHasActiveToken,

    #[error("no tokens available")]
    NoTokensAvailable,

    #[error("token not found: {0}")]
    TokenNotFound(uuid::Uuid),

    #[error("invalid token state: {0}")]
    InvalidTokenState(String),

    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

impl AppError {
    /// The HTTP status the out-of-scope adapter would map this to, per
    /// spec.md §6/§7. The core does not depend on an HTTP crate; this is
    /// just a stable, documented mapping for that collaborator to use.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::AlreadyHasActiveToken => 422,
            AppError::NoTokensAvailable => 422,
            AppError::InvalidTokenState(_) => 422,
            AppError::TokenNotFound(_) => 404,
            AppError::DatabaseError(_) => 500,
        }
    }
}

/// Errors local to the DelayedReleaseQueue, per spec.md §4.3/§7. These
/// never escape the queue worker into the Allocator's public API —
/// `NotExpired` is folded into a successful no-op job completion, and
/// `ScheduleFailed` is logged and bounded by retry, never propagated to
/// the caller of `activate`/`release`/`expireIfDue`.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("job not due or already superseded")]
    NotExpired,

    #[error("failed to schedule delayed release: {0}")]
    ScheduleFailed(String),

    #[error(transparent)]
    Allocator(#[from] AppError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_mapping() {
        assert_eq!(AppError::AlreadyHasActiveToken.status_code(), 422);
        assert_eq!(AppError::NoTokensAvailable.status_code(), 422);
        assert_eq!(
            AppError::InvalidTokenState("x".into()).status_code(),
            422
        );
        assert_eq!(AppError::TokenNotFound(uuid::Uuid::nil()).status_code(), 404);
    }
}
