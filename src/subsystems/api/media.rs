//! Media repository API.  Only the upload configuration is served.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, Uri},
    routing::get,
};
use serde_json::{Value, json};

use super::{ApiResult, authenticate};
use crate::subsystems::storage::{Datastore, DeviceDb};

/// Largest upload the node advertises, in bytes.
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

pub struct MediaApi {
    pub datastore: Datastore,
    pub devices: Arc<DeviceDb>,
}

pub fn routes(api: Arc<MediaApi>) -> Router {
    Router::new()
        .route("/_matrix/media/r0/config", get(config))
        .with_state(api)
}

/// GET /_matrix/media/r0/config
async fn config(State(api): State<Arc<MediaApi>>, headers: HeaderMap, uri: Uri) -> ApiResult<Json<Value>> {
    authenticate(&api.devices, &headers, &uri).await?;
    Ok(Json(json!({ "m.upload.size": MAX_UPLOAD_BYTES })))
}
