//! HTTP surface for agents and the connect UI.
//!
//! Endpoints:
//! - `GET  /api/services/:service/oauth/start` — redirect to the provider
//! - `GET  /api/services/:service/oauth/callback` — provider redirect target
//! - `GET  /api/connections` — connection status for the caller
//! - `DELETE /api/connections/:service` — disconnect
//! - `POST /api/invoke` — run a registered capability
//!
//! User identity comes from the bearer token; with `auth_enabled: false`
//! unauthenticated requests act as user "default" (local runs).

use crate::auth::extract_bearer_user;
use crate::credentials::{ConnectionKey, CredentialStore, StoredConnection};
use crate::error::AuthError;
use crate::injector::InvokeError;
use crate::oauth::AuthFlow;
use crate::registry::CapabilityRegistry;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared application state
pub struct ApiState {
    pub store: Arc<CredentialStore>,
    pub flow: AuthFlow,
    pub registry: CapabilityRegistry,
    pub auth_enabled: bool,
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_scopes: Option<Vec<String>>,
}

/// HTTP-mapped application error
enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String, Vec<String>),
    NotFound(String),
    Conflict(String),
    ServerError(String),
    BadGateway(String),
    Unavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, missing_scopes) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            AppError::Forbidden(msg, missing) => (StatusCode::FORBIDDEN, msg, Some(missing)),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg, None),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, None),
        };

        let body = Json(ErrorResponse {
            error: message,
            missing_scopes,
        });

        (status, body).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        let message = err.to_string();
        match err {
            AuthError::StateMismatch => AppError::Unauthorized(message),
            // User denial is handled before conversion; mapping it here
            // keeps the conversion total.
            AuthError::UserDenied => AppError::BadRequest(message),
            AuthError::UnknownService(_) => AppError::NotFound(message),
            AuthError::CodeExchange(_) => AppError::BadGateway(message),
            AuthError::TransientRefresh(_) => AppError::Unavailable(message),
            AuthError::ReauthorizationRequired | AuthError::ConnectionUnavailable => {
                AppError::Conflict("Please reconnect this service".to_string())
            }
            AuthError::InsufficientScopes(missing) => {
                AppError::Forbidden("Action needs more permission".to_string(), missing)
            }
            AuthError::Internal(_) => {
                // Detail goes to the log, not the client
                AppError::ServerError("Internal error".to_string())
            }
        }
    }
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Query parameters for the start endpoint
#[derive(Deserialize, Default)]
pub struct StartParams {
    /// Space-separated scopes beyond the service defaults.
    scopes: Option<String>,
    /// Account label for multi-account services.
    account: Option<String>,
}

/// Callback success / cancellation response
#[derive(Serialize)]
pub struct CallbackResponse {
    success: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    cancelled: bool,
    message: String,
    service: String,
}

/// Connection list response
#[derive(Serialize)]
pub struct ConnectionsResponse {
    connections: Vec<StoredConnection>,
}

/// Disconnect response
#[derive(Serialize)]
pub struct DisconnectResponse {
    success: bool,
}

/// Invoke request body
#[derive(Deserialize)]
pub struct InvokeRequest {
    service: String,
    action: String,
    #[serde(default)]
    account_label: Option<String>,
    #[serde(default)]
    params: Value,
}

/// Create the API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/services/:service/oauth/start", get(oauth_start))
        .route("/api/services/:service/oauth/callback", get(oauth_callback))
        .route("/api/connections", get(list_connections))
        .route("/api/connections/:service", delete(disconnect))
        .route("/api/invoke", post(invoke))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn caller_user_id(state: &ApiState, headers: &HeaderMap) -> Result<String, AppError> {
    if state.auth_enabled {
        extract_bearer_user(headers)
            .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))
    } else {
        Ok("default".to_string())
    }
}

/// GET /api/services/:service/oauth/start
///
/// Starts a connect flow and redirects the browser to the provider's
/// consent screen.
async fn oauth_start(
    State(state): State<Arc<ApiState>>,
    Path(service): Path<String>,
    Query(params): Query<StartParams>,
    headers: HeaderMap,
) -> Result<Redirect, AppError> {
    let user_id = caller_user_id(&state, &headers)?;
    debug!(service = %service, user_id = %user_id, "OAuth start requested");

    let requested_scopes: Vec<String> = params
        .scopes
        .as_deref()
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let url = state.flow.begin_authorization(
        &user_id,
        &service,
        params.account.as_deref(),
        requested_scopes,
    )?;

    Ok(Redirect::temporary(&url))
}

/// GET /api/services/:service/oauth/callback
///
/// Provider redirect target. Validates the single-use state, exchanges
/// the code server-side, and stores the connection. A user denial on
/// the consent screen is a cancellation, not an error.
async fn oauth_callback(
    State(state): State<Arc<ApiState>>,
    Path(service): Path<String>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Response, AppError> {
    debug!(service = %service, "OAuth callback received");

    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "No description".to_string());

        if error == "access_denied" {
            if let Some(state_token) = callback.state.as_deref() {
                state.flow.deny_authorization(state_token);
            }
            info!(service = %service, "User declined authorization");
            return Ok(Json(CallbackResponse {
                success: false,
                cancelled: true,
                message: format!("Connection to {} was cancelled", service),
                service,
            })
            .into_response());
        }

        warn!(service = %service, error = %error, description = %description, "Provider returned an error");
        return Err(AppError::BadRequest(format!(
            "Authorization failed: {}",
            error
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let state_token = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    let connection = state
        .flow
        .complete_authorization(&service, &state_token, &code)
        .await?;

    Ok(Json(CallbackResponse {
        success: true,
        cancelled: false,
        message: format!(
            "Successfully connected {} for {}",
            service, connection.key.user_id
        ),
        service,
    })
    .into_response())
}

/// GET /api/connections
///
/// Lists the caller's connections: status, scopes, and expiry. Never
/// token material.
async fn list_connections(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<ConnectionsResponse>, AppError> {
    let user_id = caller_user_id(&state, &headers)?;

    let connections = state
        .store
        .list_by_user(&user_id)
        .map_err(|e| AppError::ServerError(format!("Failed to list connections: {}", e)))?;

    Ok(Json(ConnectionsResponse { connections }))
}

/// Query parameters for disconnect
#[derive(Deserialize, Default)]
pub struct DisconnectParams {
    account: Option<String>,
}

/// DELETE /api/connections/:service
///
/// Revokes a connection. Terminal until the user reconnects.
async fn disconnect(
    State(state): State<Arc<ApiState>>,
    Path(service): Path<String>,
    Query(params): Query<DisconnectParams>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    let user_id = caller_user_id(&state, &headers)?;
    let key = ConnectionKey::new(&user_id, &service, params.account.as_deref());

    let revoked = state.flow.disconnect(&key)?;
    if !revoked {
        return Err(AppError::NotFound(format!(
            "No connection for service '{}'",
            service
        )));
    }

    Ok(Json(DisconnectResponse { success: true }))
}

/// POST /api/invoke
///
/// Runs a registered capability with the caller's credentials.
async fn invoke(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<InvokeRequest>,
) -> Result<Json<Value>, AppError> {
    let user_id = caller_user_id(&state, &headers)?;
    let key = ConnectionKey::new(&user_id, &request.service, request.account_label.as_deref());

    debug!(
        connection = %key,
        action = %request.action,
        "Invoking capability"
    );

    let result = state
        .registry
        .invoke(&key, &request.action, &request.params)
        .await
        .map_err(|e| match e {
            InvokeError::Auth(err) => AppError::from(err),
            InvokeError::Upstream(err) => AppError::BadGateway(format!("{:#}", err)),
        })?;

    Ok(Json(result))
}
