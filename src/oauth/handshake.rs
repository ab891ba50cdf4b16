//! Handshake coordination.
//!
//! ```text
//! begin:    Idle ──► Initiated (session saved) ──► redirect to provider
//! callback: AwaitingCallback ──► session taken ──► state check ──► code exchange
//!                                                      │               │
//!                                                      ▼               ▼
//!                                                   Failed          Completed
//! ```
//!
//! The session is taken before anything else is checked, so every callback
//! consumes it whatever the outcome.

use super::exchange::exchange_code;
use super::pkce::{generate_state, PkcePair};
use super::session::{HandshakeSession, SessionStore};
use crate::credentials::CredentialStore;
use crate::error::{Result, VaultError};
use crate::providers::{Provider, ProviderRegistry};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};


/// Query parameters of a provider callback
#[derive(Deserialize, Debug, Default, Clone)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// True when the request is a provider callback rather than an initiate.
    pub fn is_callback(&self) -> bool {
        self.code.is_some() || self.state.is_some() || self.error.is_some()
    }
}

/// Longest time a pending handshake stays valid (one day)
pub const MAX_SESSION_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Drives the authorization-code handshake for every provider.
pub struct HandshakeCoordinator {
    providers: Arc<ProviderRegistry>,
    sessions: Arc<dyn SessionStore>,
    store: Arc<CredentialStore>,
    client: reqwest::Client,
    callback_base_url: String,
    session_ttl: Duration,
}

impl HandshakeCoordinator {
    /// `session_ttl_seconds` is clamped to between one second and
    /// [`MAX_SESSION_TTL_SECONDS`].
    pub fn new(
        providers: Arc<ProviderRegistry>,
        sessions: Arc<dyn SessionStore>,
        store: Arc<CredentialStore>,
        callback_base_url: &str,
        session_ttl_seconds: i64,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            providers,
            sessions,
            store,
            client,
            callback_base_url: callback_base_url.trim_end_matches('/').to_string(),
            session_ttl: Duration::seconds(session_ttl_seconds.clamp(1, MAX_SESSION_TTL_SECONDS)),
        })
    }

    /// Redirect URI registered with providers; identical for begin and exchange.
    pub fn redirect_uri(&self, provider: Provider) -> String {
        format!("{}/integrations/{}", self.callback_base_url, provider)
    }

    /// Starts a handshake and returns the provider authorization URL.
    pub fn begin(&self, user_id: &str, provider: Provider, referrer: &str) -> Result<String> {
        self.begin_at(user_id, provider, referrer, Utc::now())
    }

    pub fn begin_at(
        &self,
        user_id: &str,
        provider: Provider,
        referrer: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let config = self.providers.get(provider)?;

        let state = generate_state();
        let pkce = config.profile.requires_pkce().then(PkcePair::generate);

        let session = HandshakeSession {
            user_id: user_id.to_string(),
            provider,
            state: state.clone(),
            code_verifier: pkce.as_ref().map(|p| p.verifier.clone()),
            referrer: referrer.to_string(),
            expires_at: now + self.session_ttl,
        };
        self.sessions.save(&session, now)?;

        let auth_url = config.build_auth_url(
            &state,
            &self.redirect_uri(provider),
            pkce.as_ref().map(|p| p.challenge.as_str()),
        );

        info!(
            user_id = %user_id,
            provider = %provider,
            pkce = pkce.is_some(),
            "Handshake initiated"
        );

        Ok(auth_url)
    }

    /// Completes a handshake from the provider callback.
    ///
    /// On success the credential is stored and the referrer URL (with
    /// `success=true&provider=...`) is returned.
    pub async fn complete(
        &self,
        identity: Option<&str>,
        provider: Provider,
        params: &CallbackParams,
    ) -> Result<String> {
        self.complete_at(identity, provider, params, Utc::now()).await
    }

    pub async fn complete_at(
        &self,
        identity: Option<&str>,
        provider: Provider,
        params: &CallbackParams,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let user_id = identity.ok_or_else(|| {
            warn!(provider = %provider, "Callback without an authenticated identity");
            VaultError::HandshakeState("no identity on callback".to_string())
        })?;

        // Single-use: gone from here on, whatever happens below
        let session = self.sessions.take(user_id, provider, now)?;

        if let Some(code) = &params.error {
            warn!(
                user_id = %user_id,
                provider = %provider,
                error = %code,
                "Provider reported an authorization error"
            );
            return Err(VaultError::AuthorizationDenied {
                provider,
                reason: describe_provider_error(provider, code, params.error_description.as_deref()),
            });
        }

        let session = session.ok_or_else(|| {
            warn!(user_id = %user_id, provider = %provider, "No live handshake session");
            VaultError::HandshakeState("no live session".to_string())
        })?;

        match params.state.as_deref() {
            Some(state) if constant_time_eq(state, &session.state) => {}
            _ => {
                warn!(user_id = %user_id, provider = %provider, "Handshake state mismatch");
                return Err(VaultError::HandshakeState("state mismatch".to_string()));
            }
        }

        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| VaultError::HandshakeState("missing authorization code".to_string()))?;

        let config = self.providers.get(provider)?;

        if config.profile.requires_pkce() && session.code_verifier.is_none() {
            warn!(user_id = %user_id, provider = %provider, "PKCE session without verifier");
            return Err(VaultError::HandshakeState("missing code verifier".to_string()));
        }

        debug!(user_id = %user_id, provider = %provider, "Handshake state validated");

        let bundle = exchange_code(
            &self.client,
            config,
            code,
            &self.redirect_uri(provider),
            session.code_verifier.as_deref(),
        )
        .await
        .map_err(|e| {
            warn!(user_id = %user_id, provider = %provider, error = %e, "Token exchange failed");
            e
        })?;

        self.store.upsert_at(user_id, provider, &bundle, now)?;

        info!(
            user_id = %user_id,
            provider = %provider,
            has_refresh_token = bundle.refresh_token.is_some(),
            has_secondary_token = bundle.secondary_token.is_some(),
            "Handshake completed"
        );

        Ok(append_query(
            &session.referrer,
            &[("success", "true"), ("provider", provider.as_str())],
        ))
    }
}

/// Readable reason for an OAuth `error` code reported on the callback.
pub fn describe_provider_error(provider: Provider, code: &str, description: Option<&str>) -> String {
    let name = provider.display_name();
    match code {
        "access_denied" => format!("You declined access to {}.", name),
        "invalid_scope" => format!("{} rejected the requested permissions.", name),
        "server_error" | "temporarily_unavailable" => {
            format!("{} is temporarily unavailable. Please try again.", name)
        }
        _ => match description {
            Some(description) if !description.is_empty() => {
                format!("{} reported an error: {}", name, description)
            }
            _ => format!("{} reported an error: {}", name, code),
        },
    }
}

/// Appends query parameters to a URL that may already carry some.
pub fn append_query(url: &str, params: &[(&str, &str)]) -> String {
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, separator, query)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}
