use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Pool-wide lifecycle notifications, published after the owning
/// transaction has committed.
#[derive(Clone, Debug, PartialEq)]
pub enum TokenEvent {
    Activated {
        token_id: Uuid,
        user_id: Uuid,
        activated_at: DateTime<Utc>,
    },
    Released {
        token_id: Uuid,
        released_at: DateTime<Utc>,
    },
}

impl TokenEvent {
    pub fn token_id(&self) -> Uuid {
        match self {
            TokenEvent::Activated { token_id, .. } => *token_id,
            TokenEvent::Released { token_id, .. } => *token_id,
        }
    }
}

const CHANNEL_CAPACITY: usize = 256;

/// Process-local publish/subscribe bus for `TokenEvent`s. Two kinds of
/// topic: one always-open `token_states` channel every event lands on,
/// and a per-token `token:{id}` channel created lazily the first time
/// something subscribes to that specific token. Late subscribers miss
/// anything published before they called `subscribe`; the StateCache's
/// `reload()` sweep is what keeps them eventually consistent regardless.
pub struct EventBus {
    global: broadcast::Sender<TokenEvent>,
    per_token: DashMap<Uuid, broadcast::Sender<TokenEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (global, _rx) = broadcast::channel(capacity);
        Self {
            global,
            per_token: DashMap::new(),
        }
    }

    /// Publishes to the global `token_states` topic and, if anyone has
    /// ever subscribed to this specific token, to its `token:{id}` topic
    /// too. Best-effort: a topic with no current listener silently drops
    /// the send, per spec.md §4.5 ("at-most-once, process-local").
    pub fn publish(&self, event: TokenEvent) {
        let receiver_count = self.global.send(event.clone()).unwrap_or(0);
        debug!(receiver_count, "token event published to token_states");

        if let Some(tx) = self.per_token.get(&event.token_id()) {
            let _ = tx.send(event);
        }
    }

    /// Subscribes to the global `token_states` topic (every token's
    /// events, in commit order as observed by this process).
    pub fn subscribe_all(&self) -> broadcast::Receiver<TokenEvent> {
        self.global.subscribe()
    }

    /// Subscribes to one token's `token:{id}` topic, creating it if this
    /// is the first subscriber.
    pub fn subscribe(&self, token_id: Uuid) -> broadcast::Receiver<TokenEvent> {
        self.per_token
            .entry(token_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event_on_global_topic() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_all();

        let event = TokenEvent::Activated {
            token_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            activated_at: Utc::now(),
        };
        bus.publish(event.clone());

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(TokenEvent::Released {
            token_id: Uuid::new_v4(),
            released_at: Utc::now(),
        });
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_a_copy() {
        let bus = EventBus::default();
        let mut a = bus.subscribe_all();
        let mut b = bus.subscribe_all();

        let event = TokenEvent::Released {
            token_id: Uuid::new_v4(),
            released_at: Utc::now(),
        };
        bus.publish(event.clone());

        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn per_token_subscriber_only_sees_its_own_token() {
        let bus = EventBus::default();
        let watched = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut rx = bus.subscribe(watched);

        bus.publish(TokenEvent::Released {
            token_id: other,
            released_at: Utc::now(),
        });
        bus.publish(TokenEvent::Released {
            token_id: watched,
            released_at: Utc::now(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.token_id(), watched);
    }
}
