//! Integration endpoints.
//!
//! - `GET  /integrations` lists providers and the caller's connection status
//! - `GET  /integrations/:provider` initiates a handshake, or completes one
//!   when the provider calls back with `code`/`state`/`error`
//! - `POST /integrations/:provider/revoke` disconnects a provider
//! - `POST /integrations/:provider/key` registers a personal API key

use crate::auth::{optional_user_id, resolve_user_id};
use crate::config::{AuthConfig, ServerConfig};
use crate::credentials::CredentialManager;
use crate::error::VaultError;
use crate::oauth::{append_query, CallbackParams, HandshakeCoordinator};
use crate::providers::{Provider, ProviderRegistry};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};


/// Shared application state for the integrations API
#[derive(Clone)]
pub struct IntegrationsAppState {
    pub coordinator: Arc<HandshakeCoordinator>,
    pub manager: Arc<CredentialManager>,
    pub providers: Arc<ProviderRegistry>,
    pub auth: AuthConfig,
    pub server: ServerConfig,
}

/// One row of the integrations listing
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct IntegrationStatus {
    pub provider: Provider,
    /// OAuth client credentials are present for this deployment
    pub configured: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Serialize)]
pub struct ListIntegrationsResponse {
    pub integrations: Vec<IntegrationStatus>,
}

/// Request body for POST /integrations/:provider/key
#[derive(Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for integration endpoints
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: error_message })).into_response()
    }
}

impl From<VaultError> for AppError {
    fn from(e: VaultError) -> Self {
        match &e {
            VaultError::InvalidInput(msg) => AppError::BadRequest(msg.clone()),
            VaultError::UnsupportedProvider(msg) => AppError::BadRequest(msg.clone()),
            VaultError::Configuration(msg) => {
                error!(error = %msg, "Integration not configured");
                AppError::ServerError(msg.clone())
            }
            _ => {
                error!(error = %e, "Integration request failed");
                AppError::ServerError(e.user_message())
            }
        }
    }
}

/// Create integrations API router
pub fn create_integrations_router(state: IntegrationsAppState) -> Router {
    Router::new()
        .route("/integrations", get(list_integrations))
        .route("/integrations/:provider", get(integration_entry))
        .route("/integrations/:provider/revoke", post(revoke_integration))
        .route("/integrations/:provider/key", post(register_key))
        .with_state(Arc::new(state))
}

fn parse_provider(name: &str) -> Result<Provider, AppError> {
    name.parse().map_err(|_| {
        warn!(provider = %name, "Unknown provider");
        AppError::NotFound(format!("Integration '{}' not found", name))
    })
}

fn require_user(headers: &HeaderMap, auth: &AuthConfig) -> Result<String, AppError> {
    resolve_user_id(headers, auth).map_err(|e| AppError::Unauthorized(e.to_string()))
}

/// 302 Found with a Location header
fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

/// The page to return to after the handshake.
///
/// The `Referer` header is only trusted when it belongs to the application
/// origin; anything else gets the default landing page.
pub fn select_referrer(headers: &HeaderMap, server: &ServerConfig) -> String {
    let origin = server.app_base_url.trim_end_matches('/');

    headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .filter(|referer| match referer.strip_prefix(origin) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
            None => false,
        })
        .map(str::to_string)
        .unwrap_or_else(|| server.landing_url())
}

/// GET /integrations
async fn list_integrations(
    State(state): State<Arc<IntegrationsAppState>>,
    headers: HeaderMap,
) -> Result<Json<ListIntegrationsResponse>, AppError> {
    let user_id = require_user(&headers, &state.auth)?;

    let connected: HashMap<Provider, _> = state
        .manager
        .connections(&user_id)?
        .into_iter()
        .map(|c| (c.provider, c))
        .collect();

    let integrations = Provider::ALL
        .into_iter()
        .map(|provider| {
            let connection = connected.get(&provider);
            IntegrationStatus {
                provider,
                configured: state.providers.is_configured(provider),
                connected: connection.is_some(),
                expires_at: connection.and_then(|c| c.expires_at),
                scope: connection.map(|c| c.scope.clone()).filter(|s| !s.is_empty()),
            }
        })
        .collect();

    debug!(user_id = %user_id, "Listed integrations");
    Ok(Json(ListIntegrationsResponse { integrations }))
}

/// GET /integrations/:provider
///
/// Without callback parameters this initiates the handshake and redirects to
/// the provider. With them it completes the handshake and redirects back to
/// the originating page, or to the error page with a `message`.
async fn integration_entry(
    State(state): State<Arc<IntegrationsAppState>>,
    Path(name): Path<String>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let provider = parse_provider(&name)?;

    if params.is_callback() {
        debug!(provider = %provider, "Handshake callback received");
        let identity = optional_user_id(&headers, &state.auth);

        return Ok(
            match state
                .coordinator
                .complete(identity.as_deref(), provider, &params)
                .await
            {
                Ok(location) => found(location),
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Handshake failed");
                    let message = e.user_message();
                    found(append_query(
                        &state.server.error_url(),
                        &[("message", message.as_str()), ("provider", provider.as_str())],
                    ))
                }
            },
        );
    }

    let user_id = require_user(&headers, &state.auth)?;
    let referrer = select_referrer(&headers, &state.server);

    let auth_url = state.coordinator.begin(&user_id, provider, &referrer)?;

    info!(user_id = %user_id, provider = %provider, "Redirecting to provider");
    Ok(found(auth_url))
}

/// POST /integrations/:provider/revoke
async fn revoke_integration(
    State(state): State<Arc<IntegrationsAppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, AppError> {
    let provider = parse_provider(&name)?;
    let user_id = require_user(&headers, &state.auth)?;

    state.manager.revoke(&user_id, provider).await?;

    Ok(Json(SuccessResponse { success: true }))
}

/// POST /integrations/:provider/key
async fn register_key(
    State(state): State<Arc<IntegrationsAppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<KeyRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    let provider = parse_provider(&name)?;
    let user_id = require_user(&headers, &state.auth)?;

    state.manager.register_key(&user_id, provider, &body.key)?;

    Ok(Json(SuccessResponse { success: true }))
}
