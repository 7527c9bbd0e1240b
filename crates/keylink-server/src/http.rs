//! HTTP request handlers
//!
//! Device authorization is a single JSON endpoint dispatched on `action`:
//!
//! - `{ "action": "initiate" }` from the device
//! - `{ "action": "approve", "userCode": "..." }` from a logged-in browser
//! - `{ "action": "poll", "deviceCode": "..." }` from the device

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use keylink_auth::ApiKeyInfo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Device authorization
        .route("/api/auth/device", post(device_auth_handler))
        // Key management
        .route("/api/auth/keys", get(list_keys_handler))
        .route("/api/auth/whoami", get(whoami_handler))
        // Server info
        .route("/api/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Device Authorization
// ============================================================================

/// Body of a device authorization call
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum DeviceAuthRequest {
    Initiate {
        #[serde(default, rename = "clientName")]
        client_name: Option<String>,
    },
    Approve {
        #[serde(default, rename = "userCode")]
        user_code: String,
    },
    Poll {
        #[serde(default, rename = "deviceCode")]
        device_code: String,
    },
}

/// Acknowledgement for a successful approval
#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub success: bool,
}

/// Handle `initiate`, `approve` and `poll`
///
/// The body is parsed by hand so malformed input is a 400 rather than axum's
/// default 422.
async fn device_auth_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: DeviceAuthRequest = serde_json::from_slice(&body).map_err(|e| {
        debug!("Rejected device auth body: {}", e);
        ApiError::bad_request("Invalid request body")
    })?;

    let client_ip = client_ip(&state, connect_info.as_ref(), &headers);

    match request {
        DeviceAuthRequest::Initiate { client_name } => {
            let response = state.authorizer.initiate(&client_ip, client_name).await?;
            Ok(Json(response).into_response())
        }
        DeviceAuthRequest::Approve { user_code } => {
            let user_id = state.sessions.current_user(&headers).await;
            state
                .authorizer
                .approve(user_id.as_deref(), &user_code)
                .await?;
            Ok(Json(ApproveResponse { success: true }).into_response())
        }
        DeviceAuthRequest::Poll { device_code } => {
            let response = state.authorizer.poll(&client_ip, &device_code).await?;
            Ok(Json(response).into_response())
        }
    }
}

/// Determine the address used for per-client rate limiting
fn client_ip(
    state: &AppState,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
) -> String {
    if state.trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ============================================================================
// Key Management
// ============================================================================

/// List the logged-in user's keys (prefixes only)
async fn list_keys_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ApiKeyInfo>>, ApiError> {
    let user_id = state
        .sessions
        .current_user(&headers)
        .await
        .ok_or_else(ApiError::unauthorized)?;
    Ok(Json(state.authorizer.list_keys(&user_id).await?))
}

/// Identity behind a presented API key
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WhoAmIResponse {
    pub user_id: String,
    pub key_prefix: String,
    pub name: String,
}

/// Extract a bearer token from the Authorization header
fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|auth| auth.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolve the owner of a presented API key
async fn whoami_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<WhoAmIResponse>, ApiError> {
    let token = extract_token(&headers).ok_or_else(ApiError::unauthorized)?;
    let key = state.authorizer.authenticate(token).await?;
    Ok(Json(WhoAmIResponse {
        user_id: key.user_id,
        key_prefix: key.key_prefix,
        name: key.name,
    }))
}

// ============================================================================
// Server Info
// ============================================================================

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
