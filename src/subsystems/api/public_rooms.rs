//! Public room directory.
//!
//! ```text
//! GET /_matrix/client/r0/publicRooms
//! PUT /_matrix/client/r0/directory/list/room/{room_id}
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, Uri},
    routing::{get, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::info;

use super::{ApiResult, MatrixError, authenticate, json_body};
use crate::subsystems::roomserver::RoomQueryApi;
use crate::subsystems::storage::{Datastore, DeviceDb};

pub struct PublicRoomsApi {
    pub datastore: Datastore,
    pub devices: Arc<DeviceDb>,
    pub query: Arc<RoomQueryApi>,
    /// Room ids currently listed as public.
    pub published: RwLock<BTreeSet<String>>,
}

pub fn routes(api: Arc<PublicRoomsApi>) -> Router {
    Router::new()
        .route("/_matrix/client/r0/publicRooms",                 get(public_rooms))
        .route("/_matrix/client/r0/directory/list/room/{room_id}", put(set_visibility))
        .with_state(api)
}

#[derive(Deserialize)]
struct VisibilityRequest {
    visibility: String,
}

/// GET /_matrix/client/r0/publicRooms
async fn public_rooms(State(api): State<Arc<PublicRoomsApi>>) -> Json<Value> {
    let published: Vec<String> = api.published.read().await.iter().cloned().collect();
    let mut chunk = Vec::with_capacity(published.len());
    for room_id in published {
        let name = api
            .query
            .state_event(&room_id, "m.room.name", "")
            .await
            .and_then(|e| e.content.get("name").cloned());
        chunk.push(json!({
            "room_id": room_id,
            "name": name,
            "num_joined_members": api.query.joined_members(&room_id).await.len(),
            "world_readable": false,
            "guest_can_join": false,
        }));
    }
    Json(json!({
        "total_room_count_estimate": chunk.len(),
        "chunk": chunk,
    }))
}

/// PUT /_matrix/client/r0/directory/list/room/{room_id}
async fn set_visibility(
    State(api): State<Arc<PublicRoomsApi>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Result<Json<VisibilityRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let device = authenticate(&api.devices, &headers, &uri).await?;
    let req = json_body(body)?;
    if !api.query.room_exists(&room_id).await {
        return Err(MatrixError::not_found("Unknown room"));
    }
    if !api.query.is_joined(&room_id, &device.user_id).await {
        return Err(MatrixError::forbidden("You aren't a member of the room"));
    }
    let mut published = api.published.write().await;
    match req.visibility.as_str() {
        "public" => {
            published.insert(room_id.clone());
        }
        "private" => {
            published.remove(&room_id);
        }
        other => return Err(MatrixError::invalid_param(format!("Unknown visibility {other}"))),
    }
    info!(%room_id, visibility = %req.visibility, "room visibility changed");
    Ok(Json(json!({})))
}
