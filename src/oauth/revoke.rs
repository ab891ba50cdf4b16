//! Remote token revocation.

use crate::credentials::Credential;
use crate::error::{Result, VaultError};
use crate::providers::{Provider, ProviderRegistry, RevocationStyle};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Tells a provider to invalidate the tokens of a credential.
#[async_trait]
pub trait TokenRevoker: Send + Sync {
    async fn revoke(&self, credential: &Credential) -> Result<()>;
}

/// Body of APIs that report errors as `200 {"ok": false}`
#[derive(Deserialize)]
struct OkResponse {
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP revocation using each provider's revocation style.
pub struct HttpRevoker {
    client: reqwest::Client,
    providers: Arc<ProviderRegistry>,
}

impl HttpRevoker {
    pub fn new(providers: Arc<ProviderRegistry>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, providers })
    }

    /// Configured override first, then the profile's endpoint. Revocation needs
    /// no client credentials, so an unconfigured provider still gets notified.
    fn revoke_url(&self, provider: Provider) -> Option<String> {
        self.providers
            .get(provider)
            .ok()
            .and_then(|config| config.revoke_url.clone())
            .or_else(|| provider.profile().revocation.map(|r| r.url.to_string()))
    }

    async fn post_form_token(&self, provider: Provider, url: &str, token: &str) -> Result<()> {
        let response = self
            .client
            .post(url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| revocation_error(provider, format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(revocation_error(provider, format!("status {}: {}", status, body)));
        }
        Ok(())
    }

    async fn post_bearer_token(&self, provider: Provider, url: &str, token: &str) -> Result<()> {
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| revocation_error(provider, format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(revocation_error(provider, format!("status {}: {}", status, body)));
        }

        if let Ok(parsed) = serde_json::from_str::<OkResponse>(&body) {
            if parsed.ok == Some(false) {
                return Err(revocation_error(
                    provider,
                    parsed.error.unwrap_or_else(|| "ok=false".to_string()),
                ));
            }
        }
        Ok(())
    }
}

fn revocation_error(provider: Provider, payload: String) -> VaultError {
    VaultError::Revocation { provider, payload }
}

#[async_trait]
impl TokenRevoker for HttpRevoker {
    async fn revoke(&self, credential: &Credential) -> Result<()> {
        let provider = credential.provider;
        let endpoint = provider.profile().revocation.ok_or_else(|| {
            VaultError::UnsupportedProvider(format!("{} has no revocation endpoint", provider))
        })?;
        let url = self.revoke_url(provider).ok_or_else(|| {
            VaultError::UnsupportedProvider(format!("{} has no revocation endpoint", provider))
        })?;

        debug!(user_id = %credential.user_id, provider = %provider, "Revoking tokens remotely");

        match endpoint.style {
            RevocationStyle::FormToken => {
                // Revoking the refresh token also invalidates its access tokens
                let token = credential
                    .refresh_token
                    .as_deref()
                    .unwrap_or(&credential.access_token);
                self.post_form_token(provider, &url, token).await
            }
            RevocationStyle::BearerToken => {
                self.post_bearer_token(provider, &url, &credential.access_token)
                    .await?;
                if let Some(user_token) = credential.secondary_token.as_deref() {
                    self.post_bearer_token(provider, &url, user_token).await?;
                }
                Ok(())
            }
        }
    }
}
