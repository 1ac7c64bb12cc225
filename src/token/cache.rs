use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::AppError;
use crate::events::{EventBus, TokenEvent};
use crate::logger::warn_if_slow;
use crate::token::model::{PoolStats, Token, TokenStatus};
use crate::token::repository::TokenRepository;

/// In-memory mirror of the full token pool.
///
/// Unlike a bounded LRU, this cache never evicts: the pool is a fixed set
/// of 100 rows (spec.md I1), so the whole thing comfortably fits in
/// memory at once. Reads are served from here; writes go through the
/// Allocator/Repository first and are reflected here afterward, either by
/// a targeted `upsert` from the caller or by a full `reload()` sweep from
/// the reconciler. The cache is therefore eventually consistent with the
/// database, never authoritative.
pub struct StateCache {
    repo: Arc<dyn TokenRepository>,
    events: Arc<EventBus>,
    map: Mutex<HashMap<Uuid, Token>>,
}

/// Sorts by `activated_at` descending with available (null) tokens last,
/// per spec.md §4.4.
fn sort_by_activated_at_desc_nulls_last(tokens: &mut [Token]) {
    tokens.sort_by(|a, b| match (a.activated_at, b.activated_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

impl StateCache {
    pub fn new(repo: Arc<dyn TokenRepository>, events: Arc<EventBus>) -> Self {
        Self {
            repo,
            events,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Token> {
        self.map.lock().get(id).cloned()
    }

    /// Active tokens, sorted by `activated_at` descending.
    pub fn list_active(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .map
            .lock()
            .values()
            .filter(|t| t.is_active())
            .cloned()
            .collect();
        sort_by_activated_at_desc_nulls_last(&mut tokens);
        tokens
    }

    /// Available tokens. `activated_at` is always null for these, so the
    /// spec's sort key is moot here beyond matching `list_active`'s
    /// contract shape.
    pub fn list_available(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .map
            .lock()
            .values()
            .filter(|t| !t.is_active())
            .cloned()
            .collect();
        sort_by_activated_at_desc_nulls_last(&mut tokens);
        tokens
    }

    /// All 100 tokens, active first by `activated_at` descending, then
    /// available — the ordering the `GET /tokens` collaborator exposes.
    pub fn list_all(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.map.lock().values().cloned().collect();
        sort_by_activated_at_desc_nulls_last(&mut tokens);
        tokens
    }

    /// Passthrough to the EventBus's global `token_states` topic, per
    /// spec.md §4.4's `subscribeAll()`.
    pub fn subscribe_all(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe_all()
    }

    /// Passthrough to the EventBus's per-token topic, per spec.md §4.4's
    /// `subscribe(token_id)`.
    pub fn subscribe(&self, token_id: Uuid) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe(token_id)
    }

    pub fn stats(&self) -> PoolStats {
        let map = self.map.lock();
        let active = map.values().filter(|t| t.is_active()).count();
        PoolStats {
            total: map.len(),
            active,
            available: map.len() - active,
        }
    }

    /// Inserts or replaces a single token's cached view. Called by the
    /// Allocator right after a committed `activate`/`release` to avoid
    /// waiting on the next reconciliation sweep.
    #[instrument(skip(self, token), target = "cache", fields(token_id = %token.id))]
    pub fn upsert(&self, token: Token) {
        let status = token.status;
        self.map.lock().insert(token.id, token);
        debug!(?status, "token cache entry updated");
    }

    /// Marks exactly the given tokens available. Used after `clearActive`
    /// commits, targeted at the ids the repository actually reset rather
    /// than every cached entry, so a concurrent activation that commits
    /// between `clearActive`'s transaction and this call isn't clobbered.
    pub fn bulk_mark_available(&self, token_ids: &[Uuid]) {
        let mut map = self.map.lock();
        for id in token_ids {
            if let Some(t) = map.get_mut(id) {
                t.status = TokenStatus::Available;
                t.current_user_id = None;
                t.activated_at = None;
            }
        }
        info!(count = token_ids.len(), "cache bulk-marked tokens available");
    }

    /// Replaces the entire cache contents from the repository. Run once
    /// at startup and then on the reconciler's fixed interval to correct
    /// any drift from a cache update that raced with a concurrent writer.
    #[instrument(skip(self), target = "cache")]
    pub async fn reload(&self) -> Result<(), AppError> {
        let tokens = warn_if_slow("cache_reload", Duration::from_millis(200), async {
            self.repo.list_tokens().await
        })
        .await?;

        let mut map = self.map.lock();
        map.clear();
        for t in tokens {
            map.insert(t.id, t);
        }
        info!(count = map.len(), "state cache reloaded from repository");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::token::model::{ClearResult, TokenUsage};
    use crate::token::repository::{
        ActivationOutcome, ExpireOutcome, ReleaseOutcome, TokenHistory,
    };

    struct FixedRepo {
        tokens: Vec<Token>,
    }

    #[async_trait]
    impl TokenRepository for FixedRepo {
        async fn count_total(&self) -> Result<i64, AppError> {
            Ok(self.tokens.len() as i64)
        }
        async fn count_active(&self) -> Result<i64, AppError> {
            Ok(self.tokens.iter().filter(|t| t.is_active()).count() as i64)
        }
        async fn count_open_usages(&self) -> Result<i64, AppError> {
            Ok(0)
        }
        async fn list_tokens(&self) -> Result<Vec<Token>, AppError> {
            Ok(self.tokens.clone())
        }
        async fn get_token(&self, id: Uuid) -> Result<Option<Token>, AppError> {
            Ok(self.tokens.iter().find(|t| t.id == id).cloned())
        }
        async fn get_token_history(&self, _id: Uuid) -> Result<Option<TokenHistory>, AppError> {
            Ok(None)
        }
        async fn get_user_active_token(&self, _user_id: Uuid) -> Result<Option<Token>, AppError> {
            Ok(None)
        }
        async fn try_activate(
            &self,
            _user_id: Uuid,
            _now: chrono::DateTime<Utc>,
            _ttl: chrono::Duration,
        ) -> Result<ActivationOutcome, AppError> {
            unreachable!("not exercised by cache tests")
        }
        async fn release_token(
            &self,
            _token_id: Uuid,
            _now: chrono::DateTime<Utc>,
        ) -> Result<ReleaseOutcome, AppError> {
            unreachable!("not exercised by cache tests")
        }
        async fn clear_all_active(
            &self,
            _now: chrono::DateTime<Utc>,
        ) -> Result<ClearResult, AppError> {
            unreachable!("not exercised by cache tests")
        }
        async fn expire_if_due(
            &self,
            _token_id: Uuid,
            _now: chrono::DateTime<Utc>,
            _ttl: chrono::Duration,
        ) -> Result<ExpireOutcome, AppError> {
            unreachable!("not exercised by cache tests")
        }
        async fn insert_available_token(
            &self,
            _id: Uuid,
            _now: chrono::DateTime<Utc>,
        ) -> Result<(), AppError> {
            unreachable!("not exercised by cache tests")
        }
    }

    fn mk_token(id: Uuid, active: bool) -> Token {
        let now = Utc::now();
        let mut t = Token::new_available(id, now);
        if active {
            t.status = TokenStatus::Active;
            t.current_user_id = Some(Uuid::new_v4());
            t.activated_at = Some(now);
        }
        t
    }

    #[tokio::test]
    async fn reload_populates_from_repository() {
        let a = mk_token(Uuid::new_v4(), false);
        let b = mk_token(Uuid::new_v4(), true);
        let repo = Arc::new(FixedRepo {
            tokens: vec![a.clone(), b.clone()],
        });

        let cache = StateCache::new(repo, Arc::new(EventBus::default()));
        cache.reload().await.unwrap();

        assert_eq!(cache.get(&a.id), Some(a));
        let stats = cache.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.available, 1);
    }

    #[tokio::test]
    async fn bulk_mark_available_only_touches_named_tokens() {
        let active_a = mk_token(Uuid::new_v4(), true);
        let active_b = mk_token(Uuid::new_v4(), true);
        let repo = Arc::new(FixedRepo {
            tokens: vec![active_a.clone(), active_b.clone()],
        });

        let cache = StateCache::new(repo, Arc::new(EventBus::default()));
        cache.reload().await.unwrap();
        cache.bulk_mark_available(&[active_a.id]);

        let a = cache.get(&active_a.id).unwrap();
        assert!(!a.is_active());
        assert!(a.current_user_id.is_none());
        assert!(a.activated_at.is_none());

        let b = cache.get(&active_b.id).unwrap();
        assert!(b.is_active());
    }

    #[tokio::test]
    async fn upsert_overwrites_single_entry_without_touching_others() {
        let a = mk_token(Uuid::new_v4(), false);
        let b = mk_token(Uuid::new_v4(), false);
        let repo = Arc::new(FixedRepo {
            tokens: vec![a.clone(), b.clone()],
        });

        let cache = StateCache::new(repo, Arc::new(EventBus::default()));
        cache.reload().await.unwrap();

        let mut updated = a.clone();
        updated.status = TokenStatus::Active;
        updated.current_user_id = Some(Uuid::new_v4());
        updated.activated_at = Some(Utc::now());
        cache.upsert(updated.clone());

        assert_eq!(cache.get(&a.id), Some(updated));
        assert_eq!(cache.get(&b.id), Some(b));
    }

    #[tokio::test]
    async fn list_active_sorts_by_activated_at_descending() {
        let now = Utc::now();
        let mut older = mk_token(Uuid::new_v4(), true);
        older.activated_at = Some(now - chrono::Duration::seconds(60));
        let mut newer = mk_token(Uuid::new_v4(), true);
        newer.activated_at = Some(now);

        let repo = Arc::new(FixedRepo {
            tokens: vec![older.clone(), newer.clone()],
        });
        let cache = StateCache::new(repo, Arc::new(EventBus::default()));
        cache.reload().await.unwrap();

        let active = cache.list_active();
        assert_eq!(active[0].id, newer.id);
        assert_eq!(active[1].id, older.id);
    }

    #[tokio::test]
    async fn list_all_puts_available_tokens_after_active_ones() {
        let active = mk_token(Uuid::new_v4(), true);
        let available = mk_token(Uuid::new_v4(), false);

        let repo = Arc::new(FixedRepo {
            tokens: vec![available.clone(), active.clone()],
        });
        let cache = StateCache::new(repo, Arc::new(EventBus::default()));
        cache.reload().await.unwrap();

        let all = cache.list_all();
        assert_eq!(all[0].id, active.id);
        assert_eq!(all[1].id, available.id);
    }

    #[tokio::test]
    async fn subscribe_passthrough_delivers_bus_events() {
        let repo = Arc::new(FixedRepo { tokens: vec![] });
        let events = Arc::new(EventBus::default());
        let cache = StateCache::new(repo, events.clone());

        let token_id = Uuid::new_v4();
        let mut rx = cache.subscribe(token_id);

        events.publish(TokenEvent::Released {
            token_id,
            released_at: Utc::now(),
        });

        assert_eq!(rx.recv().await.unwrap().token_id(), token_id);
    }
}
