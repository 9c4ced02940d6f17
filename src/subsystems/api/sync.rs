//! Sync API: incremental room timelines for a device.
//!
//! Sync tokens are `s{offset}` positions in the room output topic.  A
//! request with nothing new waits up to `timeout` milliseconds for the next
//! record.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, Uri},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ApiResult, MatrixError, authenticate};
use crate::config::NodeConfig;
use crate::subsystems::federation::FederationClient;
use crate::subsystems::roomserver::{RoomEvent, RoomQueryApi};
use crate::subsystems::storage::{AccountsDb, Datastore, DeviceDb};
use crate::subsystems::topic::Topic;

const MAX_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BATCH: usize = 500;

pub struct SyncApi {
    pub datastore: Datastore,
    pub devices: Arc<DeviceDb>,
    pub accounts: Arc<AccountsDb>,
    pub query: Arc<RoomQueryApi>,
    pub federation: Arc<FederationClient>,
    pub config: Arc<NodeConfig>,
    pub room_events: Topic,
}

pub fn routes(api: Arc<SyncApi>) -> Router {
    Router::new()
        .route("/_matrix/client/r0/sync", get(sync))
        .with_state(api)
}

#[derive(Deserialize, Default)]
struct SyncQuery {
    since: Option<String>,
    /// Milliseconds.
    timeout: Option<u64>,
}

fn parse_since(since: Option<&str>) -> ApiResult<u64> {
    match since {
        None => Ok(0),
        Some(token) => token
            .strip_prefix('s')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| MatrixError::invalid_param(format!("Invalid since token {token}"))),
    }
}

/// GET /_matrix/client/r0/sync
async fn sync(
    State(api): State<Arc<SyncApi>>,
    headers: HeaderMap,
    uri: Uri,
    Query(q): Query<SyncQuery>,
) -> ApiResult<Json<Value>> {
    let device = authenticate(&api.devices, &headers, &uri).await?;
    if api.accounts.account_by_user_id(&device.user_id).await.is_none() {
        return Err(MatrixError::forbidden("Account no longer exists"));
    }
    let from = parse_since(q.since.as_deref())?;
    let timeout = Duration::from_millis(q.timeout.unwrap_or(0)).min(MAX_TIMEOUT);

    // Subscribe before reading so a record appended in between still wakes us.
    let mut live = api.room_events.subscribe();
    let mut records = api.room_events.read(from, MAX_BATCH).await;
    if records.is_empty() && !timeout.is_zero() {
        let _ = tokio::time::timeout(timeout, live.recv()).await;
        records = api.room_events.read(from, MAX_BATCH).await;
    }
    let next = from + records.len() as u64;

    let mut rooms: BTreeMap<String, Vec<RoomEvent>> = BTreeMap::new();
    for record in &records {
        let Ok(event) = serde_json::from_value::<RoomEvent>(record.value.clone()) else {
            continue;
        };
        if api.query.is_joined(&event.room_id, &device.user_id).await {
            rooms.entry(event.room_id.clone()).or_default().push(event);
        }
    }

    let join: serde_json::Map<String, Value> = rooms
        .into_iter()
        .map(|(room_id, events)| (room_id, json!({ "timeline": { "events": events, "limited": false } })))
        .collect();

    Ok(Json(json!({
        "next_batch": format!("s{next}"),
        "rooms": { "join": join, "invite": {}, "leave": {} },
        "account_data": { "events": [] },
        "presence": { "events": [] },
    })))
}
