//! Account and session endpoints
//!
//! Handles:
//! - Account registration (email + auth proof digest)
//! - Login with idempotent device registration
//! - Refresh token rotation (single use)
//! - Logout

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::routes::{bearer_token, server_error, ApiError};
use crate::storage::{CredentialCheck, Device};
use crate::AppState;

/// Registration request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    /// Digest of the passphrase computed on the device; never the passphrase
    pub auth_proof: String,
}

/// Login request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub auth_proof: String,
    /// Login doubles as idempotent device registration
    pub device: Device,
}

/// An issued session
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
}

/// Successful login response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub session: Session,
    /// All devices on the account, this one included
    pub devices: Vec<Device>,
}

/// Refresh request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Handler for `POST /api/auth/register`
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    if !request.email.contains('@') || request.auth_proof.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                error: "invalid_request".to_string(),
                error_description: Some("email and authProof are required".to_string()),
            }),
        )
            .into_response();
    }

    let created = match state.storage.create_account(&request.email, &request.auth_proof) {
        Ok(created) => created,
        Err(e) => {
            tracing::error!("Failed to store account: {}", e);
            return server_error();
        }
    };
    if !created {
        return (
            StatusCode::CONFLICT,
            Json(ApiError {
                error: "account_exists".to_string(),
                error_description: Some("account already exists".to_string()),
            }),
        )
            .into_response();
    }

    tracing::info!("Registered account {}", request.email);
    (StatusCode::OK, Json(serde_json::json!({}))).into_response()
}

/// Handler for `POST /api/auth/login`
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Response {
    match state.storage.check_credentials(&request.email, &request.auth_proof) {
        CredentialCheck::Valid => {}
        CredentialCheck::WrongProof => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ApiError {
                    error: "invalid_credentials".to_string(),
                    error_description: Some("wrong credentials".to_string()),
                }),
            )
                .into_response();
        }
        CredentialCheck::UnknownAccount => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ApiError {
                    error: "invalid_credentials".to_string(),
                    error_description: Some("no such account".to_string()),
                }),
            )
                .into_response();
        }
    }

    let device_id = request.device.id.clone();
    let devices = match state.storage.upsert_device(&request.email, request.device) {
        Ok(devices) => devices,
        Err(e) => {
            tracing::error!("Failed to store device: {}", e);
            return server_error();
        }
    };

    let session = match issue_session(&state, &request.email) {
        Ok(session) => session,
        Err(response) => return response,
    };

    tracing::info!("Device {} logged in to {}", device_id, request.email);
    (
        StatusCode::OK,
        Json(LoginResponse { session, devices }),
    )
        .into_response()
}

/// Handler for `POST /api/auth/refresh`
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RefreshRequest>,
) -> Response {
    let email = match state.storage.consume_refresh_token(&request.refresh_token) {
        Ok(Some(email)) => email,
        Ok(None) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ApiError {
                    error: "invalid_grant".to_string(),
                    error_description: Some("refresh token is invalid or expired".to_string()),
                }),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("Failed to consume refresh token: {}", e);
            return server_error();
        }
    };

    // The old refresh token is already consumed; the new session replaces it
    let session = match issue_session(&state, &email) {
        Ok(session) => session,
        Err(response) => return response,
    };

    tracing::debug!("Rotated session for {}", email);
    (StatusCode::OK, Json(session)).into_response()
}

/// Handler for `POST /api/auth/logout`
pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiError {
                error: "invalid_request".to_string(),
                error_description: Some("missing bearer token".to_string()),
            }),
        )
            .into_response();
    };

    state.storage.revoke_access_token(token);
    (StatusCode::OK, Json(serde_json::json!({}))).into_response()
}

fn issue_session(state: &AppState, email: &str) -> Result<Session, Response> {
    let tokens = &state.config.tokens;
    let issued = state
        .storage
        .issue_session(
            email,
            tokens.access_token_lifetime_secs,
            tokens.refresh_token_lifetime_secs,
        )
        .map_err(|e| {
            tracing::error!("Failed to issue session: {}", e);
            server_error()
        })?;
    Ok(Session {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        access_expires_at: issued.access_expires_at,
    })
}
