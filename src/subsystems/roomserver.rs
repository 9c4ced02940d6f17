//! Roomserver: the authority on room state.
//!
//! Three handles share one in-memory room store:
//!
//! - [`RoomAliasApi`]: `#alias:server` ↔ room id.
//! - [`RoomInputApi`]: accepts new events and publishes them on the room
//!   output topic.
//! - [`RoomQueryApi`]: read-only view of state and timelines.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::AppError;
use crate::subsystems::storage::{self, Datastore};
use crate::subsystems::topic::{Topic, TopicRegistry};

#[derive(Debug, Error, PartialEq)]
pub enum RoomError {
    #[error("invalid room alias: {0}")]
    InvalidAlias(String),
    #[error("room alias already exists: {0}")]
    AliasInUse(String),
    #[error("invalid room id: {0}")]
    InvalidRoomId(String),
    #[error("unknown room: {0}")]
    UnknownRoom(String),
}

/// A persisted room event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub content: Value,
    pub origin_server_ts: i64,
}

impl RoomEvent {
    /// Server part of the sender id.
    pub fn origin(&self) -> Option<&str> {
        self.sender.split_once(':').map(|(_, server)| server)
    }
}

/// An event submitted to [`RoomInputApi::send_event`].
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub room_id: String,
    pub sender: String,
    pub event_type: String,
    pub state_key: Option<String>,
    pub content: Value,
}

#[derive(Default)]
struct Room {
    timeline: Vec<RoomEvent>,
    state: BTreeMap<(String, String), RoomEvent>,
}

#[derive(Default)]
struct RoomStore {
    rooms: HashMap<String, Room>,
    aliases: HashMap<String, String>,
}

type SharedStore = Arc<RwLock<RoomStore>>;

// ── Alias ────────────────────────────────────────────────────────────────────

pub struct RoomAliasApi {
    store: SharedStore,
}

impl RoomAliasApi {
    pub async fn set_alias(&self, alias: &str, room_id: &str) -> Result<(), RoomError> {
        if !alias.starts_with('#') || !alias.contains(':') {
            return Err(RoomError::InvalidAlias(alias.to_string()));
        }
        if !room_id.starts_with('!') {
            return Err(RoomError::InvalidRoomId(room_id.to_string()));
        }
        let mut store = self.store.write().await;
        if store.aliases.contains_key(alias) {
            return Err(RoomError::AliasInUse(alias.to_string()));
        }
        store.aliases.insert(alias.to_string(), room_id.to_string());
        debug!(alias, room_id, "alias created");
        Ok(())
    }

    pub async fn room_id_for_alias(&self, alias: &str) -> Option<String> {
        self.store.read().await.aliases.get(alias).cloned()
    }

    pub async fn aliases_for_room(&self, room_id: &str) -> Vec<String> {
        let store = self.store.read().await;
        let mut aliases: Vec<_> = store
            .aliases
            .iter()
            .filter(|(_, r)| r.as_str() == room_id)
            .map(|(a, _)| a.clone())
            .collect();
        aliases.sort();
        aliases
    }
}

// ── Input ────────────────────────────────────────────────────────────────────

pub struct RoomInputApi {
    store: SharedStore,
    output: Topic,
    server_name: String,
}

impl RoomInputApi {
    /// Append an event and publish it.  Sending into an unknown room creates
    /// it, with the sender as creator and first joined member.
    pub async fn send_event(&self, event: NewEvent) -> Result<RoomEvent, RoomError> {
        if !event.room_id.starts_with('!') {
            return Err(RoomError::InvalidRoomId(event.room_id));
        }

        let mut published = Vec::new();
        let stored = {
            let mut store = self.store.write().await;
            let room = store.rooms.entry(event.room_id.clone()).or_default();
            if room.timeline.is_empty() {
                for (event_type, state_key, content) in [
                    ("m.room.create", "", json!({ "creator": event.sender })),
                    ("m.room.member", event.sender.as_str(), json!({ "membership": "join" })),
                ] {
                    let created = self.stamp(NewEvent {
                        room_id: event.room_id.clone(),
                        sender: event.sender.clone(),
                        event_type: event_type.to_string(),
                        state_key: Some(state_key.to_string()),
                        content,
                    });
                    append(room, created.clone());
                    published.push(created);
                }
            }
            let stored = self.stamp(event);
            append(room, stored.clone());
            published.push(stored.clone());
            stored
        };

        for e in published {
            let value = serde_json::to_value(&e).unwrap_or(Value::Null);
            self.output.produce(e.room_id.clone(), value).await;
        }
        Ok(stored)
    }

    fn stamp(&self, event: NewEvent) -> RoomEvent {
        RoomEvent {
            event_id: format!("${}:{}", Uuid::new_v4().simple(), self.server_name),
            room_id: event.room_id,
            sender: event.sender,
            event_type: event.event_type,
            state_key: event.state_key,
            content: event.content,
            origin_server_ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}

fn append(room: &mut Room, event: RoomEvent) {
    if let Some(key) = &event.state_key {
        room.state
            .insert((event.event_type.clone(), key.clone()), event.clone());
    }
    room.timeline.push(event);
}

// ── Query ────────────────────────────────────────────────────────────────────

pub struct RoomQueryApi {
    store: SharedStore,
}

impl RoomQueryApi {
    pub async fn room_exists(&self, room_id: &str) -> bool {
        self.store.read().await.rooms.contains_key(room_id)
    }

    pub async fn current_state(&self, room_id: &str) -> Result<Vec<RoomEvent>, RoomError> {
        let store = self.store.read().await;
        let room = store
            .rooms
            .get(room_id)
            .ok_or_else(|| RoomError::UnknownRoom(room_id.to_string()))?;
        Ok(room.state.values().cloned().collect())
    }

    pub async fn state_event(&self, room_id: &str, event_type: &str, state_key: &str) -> Option<RoomEvent> {
        let store = self.store.read().await;
        store
            .rooms
            .get(room_id)?
            .state
            .get(&(event_type.to_string(), state_key.to_string()))
            .cloned()
    }

    /// User ids whose current membership is `join`.
    pub async fn joined_members(&self, room_id: &str) -> Vec<String> {
        let store = self.store.read().await;
        let Some(room) = store.rooms.get(room_id) else {
            return Vec::new();
        };
        room.state
            .iter()
            .filter(|((t, _), e)| t == "m.room.member" && e.content["membership"] == "join")
            .map(|((_, key), _)| key.clone())
            .collect()
    }

    pub async fn is_joined(&self, room_id: &str, user_id: &str) -> bool {
        self.state_event(room_id, "m.room.member", user_id)
            .await
            .is_some_and(|e| e.content["membership"] == "join")
    }

    /// The `limit` most recent timeline events, oldest first.
    pub async fn latest_events(&self, room_id: &str, limit: usize) -> Vec<RoomEvent> {
        let store = self.store.read().await;
        let Some(room) = store.rooms.get(room_id) else {
            return Vec::new();
        };
        let skip = room.timeline.len().saturating_sub(limit);
        room.timeline[skip..].to_vec()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.store.read().await.rooms.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ── Setup ────────────────────────────────────────────────────────────────────

pub struct RoomServer {
    pub datastore: Datastore,
    pub alias: Arc<RoomAliasApi>,
    pub input: Arc<RoomInputApi>,
    pub query: Arc<RoomQueryApi>,
}

pub(crate) async fn setup(config: &NodeConfig, topics: &TopicRegistry) -> Result<RoomServer, AppError> {
    let datastore = storage::open("roomserver", &config.database.room_server)?;
    let output = topics.topic(&config.topics.output_room_event).await;
    let store = SharedStore::default();
    info!(topic = output.name(), "roomserver ready");
    Ok(RoomServer {
        datastore,
        alias: Arc::new(RoomAliasApi { store: store.clone() }),
        input: Arc::new(RoomInputApi {
            store: store.clone(),
            output,
            server_name: config.server_name().to_string(),
        }),
        query: Arc::new(RoomQueryApi { store }),
    })
}
