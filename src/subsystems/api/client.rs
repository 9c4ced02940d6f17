//! Client-server API.
//!
//! ```text
//! GET  /_matrix/client/versions
//! POST /_matrix/client/r0/register
//! PUT  /_matrix/client/r0/rooms/{room_id}/send/{event_type}/{txn_id}
//! PUT  /_matrix/client/r0/rooms/{room_id}/typing/{user_id}
//! GET  /_matrix/client/r0/rooms/{room_id}/state
//! GET  /_matrix/client/r0/directory/room/{alias}
//! PUT  /_matrix/client/r0/directory/room/{alias}
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, Uri},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{ApiResult, MatrixError, authenticate, json_body};
use crate::subsystems::appservice::AppServiceQueryApi;
use crate::subsystems::federation::{FederationClient, KeyRing};
use crate::subsystems::fedsender::FederationSender;
use crate::subsystems::roomserver::{NewEvent, RoomAliasApi, RoomError, RoomInputApi, RoomQueryApi};
use crate::subsystems::storage::{AccountsDb, DeviceDb};
use crate::subsystems::topic::Topic;
use crate::subsystems::transactions::TransactionCache;
use crate::subsystems::typing::TypingInputApi;

const SUPPORTED_VERSIONS: &[&str] = &["r0.0.1", "r0.1.0", "r0.2.0", "r0.3.0"];

pub struct ClientApi {
    pub devices: Arc<DeviceDb>,
    pub accounts: Arc<AccountsDb>,
    pub federation: Arc<FederationClient>,
    pub key_ring: Arc<KeyRing>,
    pub alias: Arc<RoomAliasApi>,
    pub input: Arc<RoomInputApi>,
    pub query: Arc<RoomQueryApi>,
    pub typing: Arc<TypingInputApi>,
    pub appservice: Arc<AppServiceQueryApi>,
    pub transactions: TransactionCache,
    pub federation_sender: Arc<FederationSender>,
    /// Account lifecycle notifications.
    pub user_updates: Topic,
}

pub fn routes(api: Arc<ClientApi>) -> Router {
    Router::new()
        .route("/_matrix/client/versions",                                      get(versions))
        .route("/_matrix/client/r0/register",                                   post(register))
        .route("/_matrix/client/r0/rooms/{room_id}/send/{event_type}/{txn_id}", put(send_event))
        .route("/_matrix/client/r0/rooms/{room_id}/typing/{user_id}",           put(typing))
        .route("/_matrix/client/r0/rooms/{room_id}/state",                      get(room_state))
        .route("/_matrix/client/r0/directory/room/{alias}",                     get(get_alias).put(put_alias))
        .with_state(api)
}

// ── Request types ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    #[serde(default)]
    initial_device_display_name: Option<String>,
}

#[derive(Deserialize)]
struct TypingRequest {
    typing: bool,
    /// Milliseconds.
    timeout: Option<u64>,
}

#[derive(Deserialize)]
struct AliasRequest {
    room_id: String,
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// GET /_matrix/client/versions
async fn versions() -> Json<Value> {
    Json(json!({ "versions": SUPPORTED_VERSIONS }))
}

/// POST /_matrix/client/r0/register
async fn register(
    State(api): State<Arc<ClientApi>>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = json_body(body)?;
    let localpart = req.username.to_lowercase();
    if api.accounts.account_by_localpart(&localpart).await.is_some() {
        return Err(MatrixError::new(
            StatusCode::BAD_REQUEST,
            "M_USER_IN_USE",
            "Desired user ID is already taken.",
        ));
    }
    let account = api.accounts.create_account(&localpart).await.map_err(|e| {
        MatrixError::new(StatusCode::BAD_REQUEST, "M_INVALID_USERNAME", e.to_string())
    })?;
    let device = api.devices.create_device(&account.user_id).await;

    api.user_updates
        .produce(
            account.user_id.clone(),
            json!({
                "user_id": account.user_id,
                "device_id": device.device_id,
                "display_name": req.initial_device_display_name,
                "change": "registered",
            }),
        )
        .await;
    info!(user_id = %account.user_id, "account registered");

    Ok(Json(json!({
        "user_id": account.user_id,
        "access_token": device.access_token,
        "device_id": device.device_id,
        "home_server": api.federation.server_name(),
    })))
}

/// PUT /_matrix/client/r0/rooms/{room_id}/send/{event_type}/{txn_id}
async fn send_event(
    State(api): State<Arc<ClientApi>>,
    Path((room_id, event_type, txn_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    uri: Uri,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let device = authenticate(&api.devices, &headers, &uri).await?;
    let content = json_body(body)?;
    if !content.is_object() {
        return Err(MatrixError::bad_json("event content must be an object"));
    }

    let response = api
        .transactions
        .get_or_try_insert_with(&device.access_token, &txn_id, || async {
            let event = api
                .input
                .send_event(NewEvent {
                    room_id: room_id.clone(),
                    sender: device.user_id.clone(),
                    event_type,
                    state_key: None,
                    content,
                })
                .await
                .map_err(room_error)?;

            let destinations = api.federation_sender.destinations_for(&room_id).await;
            debug!(event_id = %event.event_id, destinations = destinations.len(), "event sent");
            Ok::<_, MatrixError>(json!({ "event_id": event.event_id }))
        })
        .await?;
    Ok(Json(response))
}

/// PUT /_matrix/client/r0/rooms/{room_id}/typing/{user_id}
async fn typing(
    State(api): State<Arc<ClientApi>>,
    Path((room_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
    body: Result<Json<TypingRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let device = authenticate(&api.devices, &headers, &uri).await?;
    if device.user_id != user_id {
        return Err(MatrixError::forbidden("Cannot set another user's typing state"));
    }
    let req = json_body(body)?;
    api.typing
        .set_typing(&room_id, &user_id, req.typing, req.timeout.map(Duration::from_millis))
        .await;
    Ok(Json(json!({})))
}

/// GET /_matrix/client/r0/rooms/{room_id}/state
async fn room_state(
    State(api): State<Arc<ClientApi>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<Json<Value>> {
    let device = authenticate(&api.devices, &headers, &uri).await?;
    let state = api.query.current_state(&room_id).await.map_err(room_error)?;
    if !api.query.is_joined(&room_id, &device.user_id).await {
        return Err(MatrixError::forbidden("You aren't a member of the room"));
    }
    Ok(Json(serde_json::to_value(state).unwrap_or(Value::Null)))
}

/// GET /_matrix/client/r0/directory/room/{alias}
async fn get_alias(State(api): State<Arc<ClientApi>>, Path(alias): Path<String>) -> ApiResult<Json<Value>> {
    let room_id = api
        .alias
        .room_id_for_alias(&alias)
        .await
        .ok_or_else(|| MatrixError::not_found(format!("Room alias {alias} not found")))?;
    Ok(Json(json!({
        "room_id": room_id,
        "servers": [api.federation.server_name()],
    })))
}

/// PUT /_matrix/client/r0/directory/room/{alias}
async fn put_alias(
    State(api): State<Arc<ClientApi>>,
    Path(alias): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Result<Json<AliasRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    authenticate(&api.devices, &headers, &uri).await?;
    let req = json_body(body)?;
    let domain = alias.split_once(':').map(|(_, d)| d);
    if domain != Some(api.federation.server_name()) {
        return Err(MatrixError::invalid_param("Alias must be on local server"));
    }
    api.alias.set_alias(&alias, &req.room_id).await.map_err(room_error)?;
    Ok(Json(json!({})))
}

fn room_error(e: RoomError) -> MatrixError {
    match e {
        RoomError::AliasInUse(_) => MatrixError::new(StatusCode::CONFLICT, "M_UNKNOWN", "Room alias already exists"),
        RoomError::UnknownRoom(_) => MatrixError::not_found(e.to_string()),
        RoomError::InvalidAlias(_) | RoomError::InvalidRoomId(_) => MatrixError::invalid_param(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, header};
    use tower::ServiceExt;

    use super::*;
    use crate::assembly::testing::assembled_router;

    async fn call(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn json_req(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn register(router: &Router, name: &str) -> String {
        let (status, body) = call(
            router,
            json_req("POST", "/_matrix/client/r0/register", None, json!({ "username": name })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["access_token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn versions_lists_r0() {
        let router = assembled_router().await;
        let req = Request::get("/_matrix/client/versions").body(Body::empty()).unwrap();
        let (status, body) = call(&router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["versions"].as_array().unwrap().contains(&json!("r0.3.0")));
    }

    #[tokio::test]
    async fn register_twice_is_user_in_use() {
        let router = assembled_router().await;
        register(&router, "alice").await;
        let (status, body) = call(
            &router,
            json_req("POST", "/_matrix/client/r0/register", None, json!({ "username": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errcode"], "M_USER_IN_USE");
    }

    #[tokio::test]
    async fn send_requires_token() {
        let router = assembled_router().await;
        let uri = "/_matrix/client/r0/rooms/!r:p2p/send/m.room.message/1";
        let (status, body) = call(&router, json_req("PUT", uri, None, json!({ "body": "x" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["errcode"], "M_MISSING_TOKEN");
        let (_, body) = call(&router, json_req("PUT", uri, Some("bogus"), json!({ "body": "x" }))).await;
        assert_eq!(body["errcode"], "M_UNKNOWN_TOKEN");
    }

    #[tokio::test]
    async fn send_is_idempotent_per_txn() {
        let router = assembled_router().await;
        let token = register(&router, "alice").await;
        let uri = "/_matrix/client/r0/rooms/!r:p2p/send/m.room.message/t1";
        let (status, first) = call(&router, json_req("PUT", uri, Some(&token), json!({ "body": "hi" }))).await;
        assert_eq!(status, StatusCode::OK);
        let (_, again) = call(&router, json_req("PUT", uri, Some(&token), json!({ "body": "hi" }))).await;
        assert_eq!(first["event_id"], again["event_id"]);

        let state_uri = format!("/_matrix/client/r0/rooms/!r:p2p/state?access_token={token}");
        let (status, state) = call(&router, Request::get(state_uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_retries_create_one_event() {
        let router = assembled_router().await;
        let token = register(&router, "alice").await;
        let uri = "/_matrix/client/r0/rooms/!r:p2p/send/m.room.message/t1";

        let mut handles = Vec::new();
        for _ in 0..8 {
            let router = router.clone();
            let req = json_req("PUT", uri, Some(&token), json!({ "body": "hi" }));
            handles.push(tokio::spawn(async move { call(&router, req).await }));
        }
        let mut event_ids = Vec::new();
        for handle in handles {
            let (status, body) = handle.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            event_ids.push(body["event_id"].clone());
        }
        assert!(event_ids.iter().all(|id| id == &event_ids[0]));

        let state_uri = format!("/_matrix/client/r0/rooms/!r:p2p/state?access_token={token}");
        let (_, state) = call(&router, Request::get(state_uri).body(Body::empty()).unwrap()).await;
        assert_eq!(state.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn alias_round_trip_and_conflict() {
        let router = assembled_router().await;
        let token = register(&router, "alice").await;
        let uri = "/_matrix/client/r0/directory/room/%23lobby:p2p";
        let (status, _) = call(&router, json_req("PUT", uri, Some(&token), json!({ "room_id": "!r:p2p" }))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&router, json_req("PUT", uri, Some(&token), json!({ "room_id": "!s:p2p" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&router, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["room_id"], "!r:p2p");

        let remote = "/_matrix/client/r0/directory/room/%23lobby:elsewhere";
        let (status, body) = call(&router, json_req("PUT", remote, Some(&token), json!({ "room_id": "!r:p2p" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errcode"], "M_INVALID_PARAM");
    }

    #[tokio::test]
    async fn typing_for_another_user_is_forbidden() {
        let router = assembled_router().await;
        let token = register(&router, "alice").await;
        let uri = "/_matrix/client/r0/rooms/!r:p2p/typing/@bob:p2p";
        let (status, body) = call(&router, json_req("PUT", uri, Some(&token), json!({ "typing": true }))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["errcode"], "M_FORBIDDEN");

        let own = "/_matrix/client/r0/rooms/!r:p2p/typing/@alice:p2p";
        let (status, _) = call(&router, json_req("PUT", own, Some(&token), json!({ "typing": true, "timeout": 5000 }))).await;
        assert_eq!(status, StatusCode::OK);
    }
}
