//! Typing server: who is typing where, with expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::NodeConfig;
use crate::subsystems::topic::{Topic, TopicRegistry};

/// Typing notifications without an explicit timeout last this long.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TYPING_TIMEOUT: Duration = Duration::from_secs(120);

/// Room id → user id → expiry.
#[derive(Default)]
pub struct TypingCache {
    rooms: RwLock<HashMap<String, HashMap<String, Instant>>>,
}

impl TypingCache {
    async fn set(&self, room_id: &str, user_id: &str, until: Option<Instant>) {
        let mut rooms = self.rooms.write().await;
        let users = rooms.entry(room_id.to_string()).or_default();
        match until {
            Some(until) => {
                users.insert(user_id.to_string(), until);
            }
            None => {
                users.remove(user_id);
            }
        }
    }

    /// Users currently typing in `room_id`, sorted.  Expired entries are
    /// dropped as a side effect.
    pub async fn typing_users(&self, room_id: &str) -> Vec<String> {
        let now = Instant::now();
        let mut rooms = self.rooms.write().await;
        let Some(users) = rooms.get_mut(room_id) else {
            return Vec::new();
        };
        users.retain(|_, until| *until > now);
        let mut ids: Vec<_> = users.keys().cloned().collect();
        ids.sort();
        ids
    }
}

pub struct TypingInputApi {
    cache: Arc<TypingCache>,
    output: Topic,
}

impl TypingInputApi {
    /// Record a typing change and publish the room's new typing set.
    pub async fn set_typing(&self, room_id: &str, user_id: &str, typing: bool, timeout: Option<Duration>) {
        let until = typing.then(|| {
            Instant::now() + timeout.unwrap_or(DEFAULT_TYPING_TIMEOUT).min(MAX_TYPING_TIMEOUT)
        });
        self.cache.set(room_id, user_id, until).await;
        let user_ids = self.cache.typing_users(room_id).await;
        debug!(room_id, user_id, typing, "typing updated");
        self.output
            .produce(room_id, json!({ "room_id": room_id, "user_ids": user_ids }))
            .await;
    }

    pub fn cache(&self) -> &TypingCache {
        &self.cache
    }
}

pub(crate) async fn setup(config: &NodeConfig, topics: &TopicRegistry) -> Arc<TypingInputApi> {
    Arc::new(TypingInputApi {
        cache: Arc::new(TypingCache::default()),
        output: topics.topic(&config.topics.output_typing_event).await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeFlags, assemble};
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    async fn typing() -> (Arc<TypingInputApi>, TopicRegistry) {
        let cfg = assemble(SigningKey::generate(&mut OsRng), NodeFlags::default());
        let topics = TopicRegistry::new(cfg.database.event_log.clone());
        (setup(&cfg, &topics).await, topics)
    }

    #[tokio::test]
    async fn start_and_stop_typing() {
        let (api, topics) = typing().await;
        api.set_typing("!r:p2p", "@bob:p2p", true, None).await;
        api.set_typing("!r:p2p", "@alice:p2p", true, None).await;
        assert_eq!(api.cache().typing_users("!r:p2p").await, vec!["@alice:p2p", "@bob:p2p"]);

        api.set_typing("!r:p2p", "@bob:p2p", false, None).await;
        assert_eq!(api.cache().typing_users("!r:p2p").await, vec!["@alice:p2p"]);

        let out = topics.topic("typingServerOutput").await.read(0, 10).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].value["user_ids"], json!(["@alice:p2p"]));
    }

    #[tokio::test]
    async fn entries_expire() {
        let (api, _) = typing().await;
        api.set_typing("!r:p2p", "@bob:p2p", true, Some(Duration::from_millis(10)))
            .await;
        std::thread::sleep(Duration::from_millis(20));
        assert!(api.cache().typing_users("!r:p2p").await.is_empty());
    }
}
