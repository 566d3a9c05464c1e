//! Change feed and encrypted object endpoints
//!
//! All routes require a bearer access token. Object bodies are opaque
//! ciphertext; the server assigns versions from a per-account sequence and
//! records every mutation in the change feed.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::routes::{bearer_token, server_error, ApiError};
use crate::storage::ChangeRecord;
use crate::AppState;

/// Header naming the device a mutation came from; echoed in the change
/// feed so clients can recognize their own writes.
pub const ORIGIN_DEVICE_HEADER: &str = "x-inkstone-device";

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    pub cursor: Option<String>,
}

/// A page of the change feed
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePage {
    pub changes: Vec<ChangeRecord>,
    /// Opaque resume token; replaying an older cursor is always safe
    pub cursor: String,
    pub has_more: bool,
}

/// Version assigned to an uploaded or deleted object
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: u64,
}

/// Handler for `GET /api/sync/changes`
pub async fn list_changes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ChangesQuery>,
) -> Response {
    let email = match authorize(&state, &headers) {
        Ok(email) => email,
        Err(response) => return response,
    };

    let start = match &query.cursor {
        None => 0,
        Some(c) => match c.parse::<usize>() {
            Ok(start) => start,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ApiError {
                        error: "invalid_cursor".to_string(),
                        error_description: Some(format!("bad cursor: {c}")),
                    }),
                )
                    .into_response();
            }
        },
    };

    let batch = state
        .storage
        .changes(&email, start, state.config.sync.page_size);
    (
        StatusCode::OK,
        Json(ChangePage {
            changes: batch.changes,
            cursor: batch.cursor,
            has_more: batch.has_more,
        }),
    )
        .into_response()
}

/// Handler for `GET /api/sync/objects/{*key}`
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    let email = match authorize(&state, &headers) {
        Ok(email) => email,
        Err(response) => return response,
    };
    if !valid_object_key(&key) {
        return invalid_key(&key);
    }

    match state.storage.get_object(&email, &key) {
        Some(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: "not_found".to_string(),
                error_description: Some(key),
            }),
        )
            .into_response(),
    }
}

/// Handler for `PUT /api/sync/objects/{*key}`
pub async fn put_object(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    let email = match authorize(&state, &headers) {
        Ok(email) => email,
        Err(response) => return response,
    };
    if !valid_object_key(&key) {
        return invalid_key(&key);
    }
    let origin = match origin_device(&headers) {
        Ok(origin) => origin,
        Err(response) => return response,
    };

    match state.storage.put_object(&email, &key, &body, &origin) {
        Ok(version) => {
            tracing::debug!("Stored object {} at version {}", key, version);
            (StatusCode::OK, Json(VersionResponse { version })).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to store object {}: {}", key, e);
            server_error()
        }
    }
}

/// Handler for `DELETE /api/sync/objects/{*key}`
pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    let email = match authorize(&state, &headers) {
        Ok(email) => email,
        Err(response) => return response,
    };
    if !valid_object_key(&key) {
        return invalid_key(&key);
    }
    let origin = match origin_device(&headers) {
        Ok(origin) => origin,
        Err(response) => return response,
    };

    match state.storage.delete_object(&email, &key, &origin) {
        Ok(version) => {
            tracing::debug!("Tombstoned object {} at version {}", key, version);
            (StatusCode::OK, Json(VersionResponse { version })).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to tombstone object {}: {}", key, e);
            server_error()
        }
    }
}

/// Resolve the bearer token to an account or produce the 401 response
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ApiError {
                error: "invalid_request".to_string(),
                error_description: Some("missing bearer token".to_string()),
            }),
        )
            .into_response());
    };
    state.storage.account_for_token(token).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ApiError {
                error: "invalid_token".to_string(),
                error_description: Some("access token is invalid or expired".to_string()),
            }),
        )
            .into_response()
    })
}

fn origin_device(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get(ORIGIN_DEVICE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ApiError {
                    error: "invalid_request".to_string(),
                    error_description: Some(format!("{ORIGIN_DEVICE_HEADER} header is required")),
                }),
            )
                .into_response()
        })
}

/// Keys are relative slash-separated paths; anything that could climb out
/// of the object namespace is rejected before it reaches storage.
fn valid_object_key(key: &str) -> bool {
    if key.is_empty() || key.len() > 1024 {
        return false;
    }
    if key.contains('\\') || key.contains('\0') {
        return false;
    }
    key.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

fn invalid_key(key: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError {
            error: "invalid_key".to_string(),
            error_description: Some(format!("invalid object key: {key}")),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::valid_object_key;

    #[test]
    fn test_object_key_validation() {
        assert!(valid_object_key("note.md"));
        assert!(valid_object_key("projects/alpha/plan.md"));

        assert!(!valid_object_key(""));
        assert!(!valid_object_key("/etc/passwd"));
        assert!(!valid_object_key("../escape.md"));
        assert!(!valid_object_key("notes/../../up.md"));
        assert!(!valid_object_key("notes//double.md"));
        assert!(!valid_object_key("notes/./here.md"));
        assert!(!valid_object_key("notes\\windows.md"));
        assert!(!valid_object_key("trailing/"));
    }
}
