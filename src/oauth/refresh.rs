//! Refresh-token exchange.

use super::exchange::{send_token_request, token_request};
use crate::credentials::{Credential, TokenBundle, MAX_TOKEN_LIFETIME_SECONDS};
use crate::error::{Result, VaultError};
use crate::providers::ProviderRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lifetime assumed for a refreshed token when neither the provider nor the
/// previous credential says how long it lasts
pub const DEFAULT_REFRESHED_LIFETIME_SECONDS: i64 = 3600;

/// Exchanges a credential's refresh token for a fresh access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Returns the replacement bundle. Fields the provider omitted (refresh
    /// token, scope, secondary token) carry over from `credential`.
    async fn refresh(&self, credential: &Credential) -> Result<TokenBundle>;
}

/// HTTP refresh against each provider's token endpoint.
///
/// Failures are surfaced as `RefreshFailed` and never retried here.
pub struct RefreshDispatcher {
    client: reqwest::Client,
    providers: Arc<ProviderRegistry>,
}

impl RefreshDispatcher {
    pub fn new(providers: Arc<ProviderRegistry>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, providers })
    }
}

#[async_trait]
impl TokenRefresher for RefreshDispatcher {
    async fn refresh(&self, credential: &Credential) -> Result<TokenBundle> {
        let provider = credential.provider;

        if !provider.profile().is_refreshable() {
            return Err(VaultError::UnsupportedProvider(format!(
                "{} tokens do not expire and cannot be refreshed",
                provider
            )));
        }
        let refresh_token = credential.refresh_token.as_deref().ok_or_else(|| {
            VaultError::UnsupportedProvider(format!(
                "credential for {} carries no refresh token",
                provider
            ))
        })?;

        let config = self.providers.get(provider)?;
        let url = config.refresh_url.as_deref().ok_or_else(|| {
            VaultError::UnsupportedProvider(format!("no refresh endpoint for {}", provider))
        })?;

        info!(user_id = %credential.user_id, provider = %provider, "Refreshing OAuth token");

        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        let request = token_request(&self.client, url, config, form);

        let bundle = send_token_request(request, config.profile.variant)
            .await
            .map_err(|payload| {
                warn!(
                    user_id = %credential.user_id,
                    provider = %provider,
                    payload = %payload,
                    "Token refresh failed"
                );
                VaultError::RefreshFailed { provider, payload }
            })?;

        Ok(merge_refreshed(credential, bundle))
    }
}

/// Keeps what the provider did not rotate.
///
/// A refresh response without `expires_in` reuses the lifetime the previous
/// token was issued with, so the new token still becomes due for refresh.
pub(crate) fn merge_refreshed(previous: &Credential, fresh: TokenBundle) -> TokenBundle {
    TokenBundle {
        access_token: fresh.access_token,
        refresh_token: fresh.refresh_token.or_else(|| previous.refresh_token.clone()),
        secondary_token: fresh
            .secondary_token
            .or_else(|| previous.secondary_token.clone()),
        token_type: fresh.token_type,
        scope: if fresh.scope.is_empty() {
            previous.scope.clone()
        } else {
            fresh.scope
        },
        expires_in: fresh.expires_in.or_else(|| Some(previous_lifetime(previous))),
    }
}

fn previous_lifetime(previous: &Credential) -> i64 {
    previous
        .expires_at
        .map(|expires_at| (expires_at - previous.updated_at).num_seconds())
        .filter(|seconds| *seconds > 0 && *seconds <= MAX_TOKEN_LIFETIME_SECONDS)
        .unwrap_or(DEFAULT_REFRESHED_LIFETIME_SECONDS)
}
