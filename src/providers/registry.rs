//! Provider profiles bound to deployment configuration.

use super::{Provider, ProviderProfile};
use crate::config::ProviderSettings;
use crate::error::{Result, VaultError};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// A provider profile plus the client credentials and endpoints of this deployment.
#[derive(Clone)]
pub struct ProviderConfig {
    pub profile: &'static ProviderProfile,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub auth_url: String,
    pub token_url: String,
    pub refresh_url: Option<String>,
    pub revoke_url: Option<String>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider", &self.profile.provider)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("refresh_url", &self.refresh_url)
            .field("revoke_url", &self.revoke_url)
            .finish()
    }
}

impl ProviderConfig {
    /// Binds a provider's static profile to a client id/secret pair using the
    /// profile's default endpoints and scopes.
    pub fn new(provider: Provider, client_id: &str, client_secret: &str) -> Self {
        let profile = provider.profile();
        Self {
            profile,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scopes: profile.scopes.iter().map(|s| s.to_string()).collect(),
            auth_url: profile.auth_url.to_string(),
            token_url: profile.token_url.to_string(),
            refresh_url: profile.refresh_url.map(str::to_string),
            revoke_url: profile.revocation.map(|r| r.url.to_string()),
        }
    }

    /// Builds a config from file/env settings. Returns `None` when either half of
    /// the client credential pair is missing.
    pub fn from_settings(provider: Provider, settings: &ProviderSettings) -> Option<Self> {
        let client_id = settings.client_id.as_deref().filter(|s| !s.is_empty())?;
        let client_secret = settings.client_secret.as_deref().filter(|s| !s.is_empty())?;

        let mut config = Self::new(provider, client_id, client_secret);
        if let Some(scopes) = &settings.scopes {
            config.scopes = scopes.clone();
        }
        if let Some(url) = &settings.auth_url {
            config.auth_url = url.clone();
        }
        if let Some(url) = &settings.token_url {
            config = config.with_token_url(url);
        }
        if let Some(url) = &settings.refresh_url {
            if config.profile.is_refreshable() {
                config.refresh_url = Some(url.clone());
            }
        }
        if let Some(url) = &settings.revoke_url {
            if config.profile.is_revocable() {
                config.revoke_url = Some(url.clone());
            }
        }
        Some(config)
    }

    pub fn provider(&self) -> Provider {
        self.profile.provider
    }

    /// Points the token endpoint elsewhere. A refresh endpoint that shares the
    /// profile's token endpoint follows it.
    pub fn with_token_url(mut self, url: &str) -> Self {
        if self.profile.refresh_url == Some(self.profile.token_url) {
            self.refresh_url = Some(url.to_string());
        }
        self.token_url = url.to_string();
        self
    }

    pub fn with_revoke_url(mut self, url: &str) -> Self {
        if self.profile.is_revocable() {
            self.revoke_url = Some(url.to_string());
        }
        self
    }

    /// Build authorization URL with state, redirect_uri and optional PKCE challenge
    pub fn build_auth_url(
        &self,
        state: &str,
        redirect_uri: &str,
        code_challenge: Option<&str>,
    ) -> String {
        let scopes = self.scopes.join(self.profile.scope_separator);
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        );

        if !self.profile.user_scopes.is_empty() {
            let user_scopes = self.profile.user_scopes.join(self.profile.scope_separator);
            url.push_str(&format!("&user_scope={}", urlencoding::encode(&user_scopes)));
        }

        if let Some(challenge) = code_challenge {
            url.push_str(&format!(
                "&code_challenge={}&code_challenge_method=S256",
                urlencoding::encode(challenge)
            ));
        }

        for (key, value) in self.profile.extra_auth_params {
            url.push_str(&format!("&{}={}", key, urlencoding::encode(value)));
        }

        url
    }
}

/// Lookup table of configured providers.
#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    configs: HashMap<Provider, ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry from the `[providers.<name>]` configuration sections.
    ///
    /// Unknown section names are logged and skipped; providers without a complete
    /// client credential pair stay unconfigured.
    pub fn from_settings(settings: &HashMap<String, ProviderSettings>) -> Self {
        let mut registry = Self::new();

        for (name, provider_settings) in settings {
            let provider: Provider = match name.parse() {
                Ok(p) => p,
                Err(_) => {
                    warn!(provider = %name, "Ignoring settings for unknown provider");
                    continue;
                }
            };

            match ProviderConfig::from_settings(provider, provider_settings) {
                Some(config) => {
                    debug!(provider = %provider, "Provider configured");
                    registry.insert(config);
                }
                None => {
                    debug!(provider = %provider, "Provider missing client credentials");
                }
            }
        }

        registry
    }

    pub fn insert(&mut self, config: ProviderConfig) {
        self.configs.insert(config.provider(), config);
    }

    /// Returns the provider's configuration, or a `Configuration` error naming
    /// the environment variables that would configure it.
    pub fn get(&self, provider: Provider) -> Result<&ProviderConfig> {
        self.configs.get(&provider).ok_or_else(|| {
            let prefix = provider.as_str().to_uppercase();
            VaultError::Configuration(format!(
                "OAuth not configured for '{}'. Set CREDVAULT_OAUTH_{}_CLIENT_ID and CREDVAULT_OAUTH_{}_CLIENT_SECRET.",
                provider, prefix, prefix
            ))
        })
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        self.configs.contains_key(&provider)
    }
}
