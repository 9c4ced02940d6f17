//! HTTP API surfaces mounted on the shared [`ApiMux`].
//!
//! Each surface owns a state struct holding the handles it was built from and
//! contributes a `Router` via its `routes` function.  All of them answer
//! errors in the Matrix shape `{"errcode": "...", "error": "..."}`.

pub mod client;
pub mod federation;
pub mod media;
pub mod public_rooms;
pub mod sync;

use axum::{
    Json, Router,
    extract::{Query, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::subsystems::storage::{Device, DeviceDb};

// ── ApiMux ────────────────────────────────────────────────────────────────────

/// Collects the routes of every API surface before the transport wraps them.
#[derive(Default)]
pub struct ApiMux {
    router: Router,
    mounted: Vec<&'static str>,
}

impl ApiMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, surface: &'static str, routes: Router) {
        debug!(surface, "mounting api routes");
        self.router = std::mem::take(&mut self.router).merge(routes);
        self.mounted.push(surface);
    }

    pub fn mounted(&self) -> &[&'static str] {
        &self.mounted
    }

    pub fn into_router(self) -> Router {
        self.router
    }
}

// ── MatrixError ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixError {
    pub status: StatusCode,
    pub errcode: &'static str,
    pub error: String,
}

impl MatrixError {
    pub fn new(status: StatusCode, errcode: &'static str, error: impl Into<String>) -> Self {
        Self {
            status,
            errcode,
            error: error.into(),
        }
    }

    pub fn missing_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "M_MISSING_TOKEN", "Missing access token")
    }

    pub fn unknown_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "M_UNKNOWN_TOKEN", "Unknown access token")
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "M_FORBIDDEN", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "M_NOT_FOUND", msg)
    }

    pub fn bad_json(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "M_BAD_JSON", msg)
    }

    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "M_INVALID_PARAM", msg)
    }
}

impl IntoResponse for MatrixError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "errcode": self.errcode, "error": self.error })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, MatrixError>;

/// Unwrap a JSON body, turning axum's rejection into `M_BAD_JSON`/`M_NOT_JSON`.
pub fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(JsonRejection::MissingJsonContentType(_)) | Err(JsonRejection::JsonSyntaxError(_)) => Err(
            MatrixError::new(StatusCode::BAD_REQUEST, "M_NOT_JSON", "Content not JSON"),
        ),
        Err(e) => Err(MatrixError::bad_json(e.body_text())),
    }
}

/// Catch-all for unknown paths.
pub async fn unrecognized() -> MatrixError {
    MatrixError::new(StatusCode::NOT_FOUND, "M_UNRECOGNIZED", "Unrecognized request")
}

// ── Authentication ────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct AccessTokenQuery {
    access_token: Option<String>,
}

/// The access token from `Authorization: Bearer …` or `?access_token=`.
pub fn access_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.trim().to_string());
    }
    Query::<AccessTokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.access_token)
}

/// Resolve the calling device or fail with a Matrix auth error.
pub async fn authenticate(devices: &DeviceDb, headers: &HeaderMap, uri: &Uri) -> ApiResult<Device> {
    let token = access_token(headers, uri).ok_or_else(MatrixError::missing_token)?;
    devices
        .device_by_token(&token)
        .await
        .ok_or_else(MatrixError::unknown_token)
}
