use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One of the fixed 100 allocation slots.
///
/// `status` and `current_user_id`/`activated_at` must agree: a token is
/// either available (both null) or active (both set). The repository and
/// allocator are jointly responsible for never persisting a row that
/// violates this.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub id: Uuid,
    pub status: TokenStatus,
    pub current_user_id: Option<Uuid>,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    Available,
    Active,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Available => "available",
            TokenStatus::Active => "active",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "available" => Ok(TokenStatus::Available),
            "active" => Ok(TokenStatus::Active),
            other => Err(anyhow::anyhow!("unknown token status: {other}")),
        }
    }
}

impl Token {
    /// Constructs a fresh, available token row. Used only by seeding.
    pub fn new_available(id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TokenStatus::Available,
            current_user_id: None,
            activated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TokenStatus::Active
    }

    /// Deadline at which an active token is eligible for automatic release.
    /// Panics if called on an available token — callers must check
    /// `is_active()` first, mirroring the invariant the Store enforces.
    pub fn expires_at(&self, ttl: chrono::Duration) -> DateTime<Utc> {
        self.activated_at
            .expect("expires_at called on a token with no activation timestamp")
            + ttl
    }
}

/// One activation epoch for a token. Closed usages are immutable; only
/// `ended_at` is ever written after insert, and only once.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenUsage {
    pub id: Uuid,
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TokenUsage {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Result of a single `clearActive` sweep.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ClearResult {
    pub tokens_reset: u32,
    pub usages_closed: u32,
    /// Ids of the tokens that were actually active and got reset, so the
    /// Allocator can target just those cache entries and publish exactly
    /// one `token_released` event per token, per spec.md §4.2/§9.
    pub reset_token_ids: Vec<Uuid>,
}

/// Snapshot counts exposed by both the Repository (authoritative) and the
/// StateCache (eventually consistent).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub available: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn new_available_token_has_null_user_and_activation() {
        let t = Token::new_available(Uuid::new_v4(), now());
        assert_eq!(t.status, TokenStatus::Available);
        assert!(t.current_user_id.is_none());
        assert!(t.activated_at.is_none());
        assert!(!t.is_active());
    }

    #[test]
    fn expires_at_adds_ttl_to_activation() {
        let mut t = Token::new_available(Uuid::new_v4(), now());
        t.status = TokenStatus::Active;
        t.activated_at = Some(now());
        t.current_user_id = Some(Uuid::new_v4());

        let ttl = chrono::Duration::seconds(120);
        assert_eq!(t.expires_at(ttl), now() + ttl);
    }

    #[test]
    #[should_panic]
    fn expires_at_panics_without_activation() {
        let t = Token::new_available(Uuid::new_v4(), now());
        let _ = t.expires_at(chrono::Duration::seconds(120));
    }

    #[test]
    fn status_round_trips_through_str() {
        assert_eq!(
            TokenStatus::from_str("active").unwrap(),
            TokenStatus::Active
        );
        assert_eq!(
            TokenStatus::from_str("available").unwrap(),
            TokenStatus::Available
        );
        assert!(TokenStatus::from_str("bogus").is_err());
    }

    #[test]
    fn usage_is_open_until_ended_at_set() {
        let u = TokenUsage {
            id: Uuid::new_v4(),
            token_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            started_at: now(),
            ended_at: None,
            created_at: now(),
        };
        assert!(u.is_open());

        let mut closed = u.clone();
        closed.ended_at = Some(now());
        assert!(!closed.is_open());
    }
}
