//! HTTP surface of the sync server
//!
//! Auth endpoints are open; everything under `/api/sync` requires a bearer
//! access token. Object keys may contain slashes, so those routes use a
//! wildcard capture.

pub mod auth;
pub mod sync;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Error body returned by every endpoint
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let max_body = state.config.sync.max_object_bytes;
    Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/refresh", post(auth::refresh))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/sync/changes", get(sync::list_changes))
        .route(
            "/api/sync/objects/{*key}",
            get(sync::get_object)
                .put(sync::put_object)
                .delete(sync::delete_object),
        )
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Extract the token from an `Authorization: Bearer ...` header
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

pub(crate) fn server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            error: "server_error".to_string(),
            error_description: None,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use chrono::Utc;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::{router, sync::ORIGIN_DEVICE_HEADER};
    use crate::config::{Config, SyncConfig};
    use crate::storage::Storage;
    use crate::AppState;

    const EMAIL: &str = "pat@example.com";
    const PROOF: &str = "deadbeef-auth-proof";

    fn app_at(dir: &TempDir, config: Config) -> axum::Router {
        let storage = Storage::new(dir.path().to_str().unwrap()).unwrap();
        router(Arc::new(AppState { config, storage }))
    }

    fn test_app() -> (axum::Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let app = app_at(&dir, Config::default());
        (app, dir)
    }

    fn parse_json(bytes: &[u8]) -> Value {
        if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(bytes).unwrap()
        }
    }

    async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn post_json(app: &axum::Router, uri: &str, body: &Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, bytes) = send(app, request).await;
        (status, parse_json(&bytes))
    }

    fn device_json(id: &str) -> Value {
        json!({
            "id": id,
            "displayName": format!("device {id}"),
            "publicFingerprint": "fp",
            "createdAt": Utc::now(),
            "lastSeenAt": Utc::now(),
        })
    }

    async fn register(app: &axum::Router) {
        let (status, _) = post_json(
            app,
            "/api/auth/register",
            &json!({ "email": EMAIL, "authProof": PROOF }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    /// Log a device in, returning (access token, refresh token, response body)
    async fn login(app: &axum::Router, device_id: &str) -> (String, String, Value) {
        let (status, body) = post_json(
            app,
            "/api/auth/login",
            &json!({ "email": EMAIL, "authProof": PROOF, "device": device_json(device_id) }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let access = body["session"]["accessToken"].as_str().unwrap().to_string();
        let refresh = body["session"]["refreshToken"].as_str().unwrap().to_string();
        (access, refresh, body)
    }

    async fn put_object(
        app: &axum::Router,
        token: &str,
        device: &str,
        key: &str,
        body: &[u8],
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("PUT")
            .uri(format!("/api/sync/objects/{key}"))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(ORIGIN_DEVICE_HEADER, device)
            .body(Body::from(body.to_vec()))
            .unwrap();
        let (status, bytes) = send(app, request).await;
        (status, parse_json(&bytes))
    }

    async fn delete_object(
        app: &axum::Router,
        token: &str,
        device: &str,
        key: &str,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/sync/objects/{key}"))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(ORIGIN_DEVICE_HEADER, device)
            .body(Body::empty())
            .unwrap();
        let (status, bytes) = send(app, request).await;
        (status, parse_json(&bytes))
    }

    async fn get_object(app: &axum::Router, token: &str, key: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method("GET")
            .uri(format!("/api/sync/objects/{key}"))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        send(app, request).await
    }

    async fn get_changes(
        app: &axum::Router,
        token: &str,
        cursor: Option<&str>,
    ) -> (StatusCode, Value) {
        let uri = match cursor {
            Some(c) => format!("/api/sync/changes?cursor={c}"),
            None => "/api/sync/changes".to_string(),
        };
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, bytes) = send(app, request).await;
        (status, parse_json(&bytes))
    }

    #[tokio::test]
    async fn test_register_login_and_reject_bad_credentials() {
        let (app, _dir) = test_app();
        register(&app).await;

        // Duplicate registration is refused
        let (status, body) = post_json(
            &app,
            "/api/auth/register",
            &json!({ "email": EMAIL, "authProof": "other" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "account_exists");

        // Wrong proof and unknown account both fail closed
        let (status, _) = post_json(
            &app,
            "/api/auth/login",
            &json!({ "email": EMAIL, "authProof": "wrong", "device": device_json("d1") }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = post_json(
            &app,
            "/api/auth/login",
            &json!({ "email": "nobody@example.com", "authProof": PROOF, "device": device_json("d1") }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // A good login issues tokens and registers the device
        let (_, _, body) = login(&app, "d1").await;
        assert!(!body["session"]["accessToken"].as_str().unwrap().is_empty());
        assert!(!body["session"]["refreshToken"].as_str().unwrap().is_empty());
        assert_eq!(body["devices"].as_array().unwrap().len(), 1);

        // Logging in again merges by device id instead of duplicating
        let (_, _, body) = login(&app, "d2").await;
        assert_eq!(body["devices"].as_array().unwrap().len(), 2);
        let (_, _, body) = login(&app, "d1").await;
        assert_eq!(body["devices"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_rejects_reuse() {
        let (app, _dir) = test_app();
        register(&app).await;
        let (access, refresh, _) = login(&app, "d1").await;

        let (status, body) = post_json(
            &app,
            "/api/auth/refresh",
            &json!({ "refreshToken": refresh }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let new_access = body["accessToken"].as_str().unwrap().to_string();
        let new_refresh = body["refreshToken"].as_str().unwrap().to_string();
        assert_ne!(new_access, access);
        assert_ne!(new_refresh, refresh);

        // The consumed refresh token is gone
        let (status, _) = post_json(
            &app,
            "/api/auth/refresh",
            &json!({ "refreshToken": refresh }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // The rotated one works
        let (status, _) = post_json(
            &app,
            "/api/auth/refresh",
            &json!({ "refreshToken": new_refresh }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_objects_roundtrip_through_the_feed() {
        let (app, _dir) = test_app();
        register(&app).await;
        let (access, _, _) = login(&app, "d1").await;

        let (status, body) =
            put_object(&app, &access, "d1", "projects/alpha/plan.md", b"ciphertext-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 1);

        // The feed reports the write with its origin device
        let (status, page) = get_changes(&app, &access, None).await;
        assert_eq!(status, StatusCode::OK);
        let changes = page["changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["key"], "projects/alpha/plan.md");
        assert_eq!(changes[0]["version"], 1);
        assert_eq!(changes[0]["deleted"], false);
        assert_eq!(changes[0]["originDevice"], "d1");
        assert_eq!(page["cursor"], "1");
        assert_eq!(page["hasMore"], false);

        // Download returns the exact bytes as an octet stream
        let request = Request::builder()
            .method("GET")
            .uri("/api/sync/objects/projects/alpha/plan.md")
            .header(header::AUTHORIZATION, format!("Bearer {access}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ciphertext-1");

        // Overwrites bump the version; resuming from the cursor sees only them
        let (_, body) =
            put_object(&app, &access, "d1", "projects/alpha/plan.md", b"ciphertext-2").await;
        assert_eq!(body["version"], 2);
        let (_, page) = get_changes(&app, &access, Some("1")).await;
        let changes = page["changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["version"], 2);
    }

    #[tokio::test]
    async fn test_delete_tombstones_and_reaches_the_feed() {
        let (app, _dir) = test_app();
        register(&app).await;
        let (access, _, _) = login(&app, "d1").await;

        put_object(&app, &access, "d1", "note.md", b"cipher").await;
        let (status, body) = delete_object(&app, &access, "d2", "note.md").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 2);

        let (status, _) = get_object(&app, &access, "note.md").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, page) = get_changes(&app, &access, Some("1")).await;
        let changes = page["changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["deleted"], true);
        assert_eq!(changes[0]["originDevice"], "d2");
    }

    #[tokio::test]
    async fn test_rejects_missing_auth_bad_cursor_and_traversal() {
        let (app, _dir) = test_app();
        register(&app).await;
        let (access, _, _) = login(&app, "d1").await;

        // No bearer token
        let request = Request::builder()
            .method("GET")
            .uri("/api/sync/changes")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Garbage cursor
        let (status, body) = get_changes(&app, &access, Some("abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_cursor");

        // Upload without naming the origin device
        let request = Request::builder()
            .method("PUT")
            .uri("/api/sync/objects/note.md")
            .header(header::AUTHORIZATION, format!("Bearer {access}"))
            .body(Body::from("cipher"))
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Keys that climb out of the namespace
        let (status, body) = put_object(&app, &access, "d1", "../escape.md", b"x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_key");
        let (status, _) = put_object(&app, &access, "d1", "notes/../../up.md", b"x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // A revoked access token stops working
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/logout")
            .header(header::AUTHORIZATION, format!("Bearer {access}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get_changes(&app, &access, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_sessions_survive_restart_via_refresh() {
        let dir = TempDir::new().unwrap();
        let app = app_at(&dir, Config::default());
        register(&app).await;
        let (access, refresh, _) = login(&app, "d1").await;
        put_object(&app, &access, "d1", "note.md", b"cipher").await;
        drop(app);

        // A fresh process: access grants are gone, refresh tokens persist
        let app = app_at(&dir, Config::default());
        let (status, _) = get_changes(&app, &access, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = post_json(
            &app,
            "/api/auth/refresh",
            &json!({ "refreshToken": refresh }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let new_access = body["accessToken"].as_str().unwrap();

        let (status, bytes) = get_object(&app, new_access, "note.md").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"cipher");
    }

    #[tokio::test]
    async fn test_feed_pages_respect_configured_size() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            sync: SyncConfig {
                page_size: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let app = app_at(&dir, config);
        register(&app).await;
        let (access, _, _) = login(&app, "d1").await;

        for key in ["a.md", "b.md", "c.md"] {
            put_object(&app, &access, "d1", key, b"cipher").await;
        }

        let (_, page) = get_changes(&app, &access, None).await;
        assert_eq!(page["changes"].as_array().unwrap().len(), 2);
        assert_eq!(page["cursor"], "2");
        assert_eq!(page["hasMore"], true);

        let (_, page) = get_changes(&app, &access, Some("2")).await;
        assert_eq!(page["changes"].as_array().unwrap().len(), 1);
        assert_eq!(page["hasMore"], false);

        // Replaying an older cursor is safe and starts from the top
        let (_, page) = get_changes(&app, &access, Some("0")).await;
        assert_eq!(page["changes"].as_array().unwrap()[0]["key"], "a.md");
    }
}
