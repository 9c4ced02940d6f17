//! Server-server API.
//!
//! ```text
//! GET /_matrix/federation/v1/version
//! GET /_matrix/key/v2/server
//! GET /_matrix/federation/v1/query/directory?room_alias=…   (X-Matrix auth)
//! GET /_matrix/federation/v1/query/profile?user_id=…        (X-Matrix auth)
//! ```

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, Uri, header},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ApiResult, MatrixError};
use crate::subsystems::appservice::AppServiceQueryApi;
use crate::subsystems::federation::{FederationClient, KeyRing, XMatrixAuth};
use crate::subsystems::fedsender::FederationSender;
use crate::subsystems::roomserver::{RoomAliasApi, RoomInputApi, RoomQueryApi};
use crate::subsystems::storage::{AccountsDb, DeviceDb};

pub struct FederationApi {
    pub accounts: Arc<AccountsDb>,
    pub devices: Arc<DeviceDb>,
    pub federation: Arc<FederationClient>,
    pub key_ring: Arc<KeyRing>,
    pub alias: Arc<RoomAliasApi>,
    pub input: Arc<RoomInputApi>,
    pub query: Arc<RoomQueryApi>,
    pub appservice: Arc<AppServiceQueryApi>,
    pub federation_sender: Arc<FederationSender>,
}

pub fn routes(api: Arc<FederationApi>) -> Router {
    Router::new()
        .route("/_matrix/federation/v1/version",         get(version))
        .route("/_matrix/key/v2/server",                 get(server_keys))
        .route("/_matrix/federation/v1/query/directory", get(query_directory))
        .route("/_matrix/federation/v1/query/profile",   get(query_profile))
        .with_state(api)
}

#[derive(Deserialize)]
struct DirectoryQuery {
    room_alias: String,
}

#[derive(Deserialize)]
struct ProfileQuery {
    user_id: String,
}

/// Check the request's X-Matrix signature; returns the requesting server.
async fn authenticate_origin(api: &FederationApi, headers: &HeaderMap, uri: &Uri) -> ApiResult<String> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(XMatrixAuth::parse)
        .ok_or_else(|| MatrixError::new(StatusCode::UNAUTHORIZED, "M_UNAUTHORIZED", "Missing X-Matrix authorization"))?;
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or_else(|| uri.path());
    api.key_ring
        .verify_request(&auth, "GET", path, None)
        .await
        .map_err(|e| {
            warn!(origin = %auth.origin, "federation request rejected: {e}");
            MatrixError::forbidden(e.to_string())
        })
}

/// GET /_matrix/federation/v1/version
async fn version() -> Json<Value> {
    Json(json!({
        "server": { "name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") }
    }))
}

/// GET /_matrix/key/v2/server
async fn server_keys(State(api): State<Arc<FederationApi>>) -> Json<Value> {
    Json(api.federation.own_server_keys())
}

/// GET /_matrix/federation/v1/query/directory
async fn query_directory(
    State(api): State<Arc<FederationApi>>,
    headers: HeaderMap,
    uri: Uri,
    Query(q): Query<DirectoryQuery>,
) -> ApiResult<Json<Value>> {
    let origin = authenticate_origin(&api, &headers, &uri).await?;
    debug!(%origin, alias = %q.room_alias, "federation directory query");
    let room_id = api
        .alias
        .room_id_for_alias(&q.room_alias)
        .await
        .ok_or_else(|| MatrixError::not_found("Room alias not found"))?;
    let mut servers: Vec<String> = api.federation_sender.destinations_for(&room_id).await.into_iter().collect();
    servers.insert(0, api.federation.server_name().to_string());
    Ok(Json(json!({ "room_id": room_id, "servers": servers })))
}

/// GET /_matrix/federation/v1/query/profile
async fn query_profile(
    State(api): State<Arc<FederationApi>>,
    headers: HeaderMap,
    uri: Uri,
    Query(q): Query<ProfileQuery>,
) -> ApiResult<Json<Value>> {
    authenticate_origin(&api, &headers, &uri).await?;
    let account = api
        .accounts
        .account_by_user_id(&q.user_id)
        .await
        .ok_or_else(|| MatrixError::not_found("User not found"))?;
    Ok(Json(json!({ "displayname": account.localpart })))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::assembly::testing::assembled;

    async fn call(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn version_and_keys_are_public() {
        let (router, _) = assembled().await;
        let (status, body) = call(&router, Request::get("/_matrix/federation/v1/version").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server"]["name"], "p2pnode");

        let (status, keys) = call(&router, Request::get("/_matrix/key/v2/server").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(keys["server_name"], "p2p");
        assert!(keys["signatures"]["p2p"]["ed25519:p2pdemo"].is_string());
    }

    #[tokio::test]
    async fn directory_query_needs_a_valid_signature() {
        let (router, node) = assembled().await;
        node.alias.set_alias("#lobby:p2p", "!r:p2p").await.unwrap();
        let uri = "/_matrix/federation/v1/query/directory?room_alias=%23lobby:p2p";

        let (status, _) = call(&router, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let auth = node.federation.sign_request("GET", uri, "p2p", None);
        let req = Request::get(uri).header(header::AUTHORIZATION, auth.clone()).body(Body::empty()).unwrap();
        let (status, body) = call(&router, req).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["room_id"], "!r:p2p");
        assert_eq!(body["servers"][0], "p2p");

        // Signature over a different uri does not carry over.
        let other = "/_matrix/federation/v1/query/directory?room_alias=%23other:p2p";
        let req = Request::get(other).header(header::AUTHORIZATION, auth).body(Body::empty()).unwrap();
        let (status, _) = call(&router, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
