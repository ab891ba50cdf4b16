mod env;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Complete credvault configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Per-provider client credentials, keyed by provider identifier (e.g. `gmail`)
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Public base URL providers redirect back to; redirect URIs are
    /// `{callback_base_url}/integrations/{provider}`
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// Origin of the user-facing application; referrers outside it are ignored
    #[serde(default = "default_app_base_url")]
    pub app_base_url: String,
    /// Landing page used when the initiating request carried no usable referrer
    #[serde(default = "default_landing_path")]
    pub landing_path: String,
    /// Page that renders handshake failures from its `message` parameter
    #[serde(default = "default_error_path")]
    pub error_path: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_callback_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_app_base_url() -> String {
    "http://localhost:5173".to_string()
}

fn default_landing_path() -> String {
    "/integrations".to_string()
}

fn default_error_path() -> String {
    "/integrations/error".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            callback_base_url: default_callback_base_url(),
            app_base_url: default_app_base_url(),
            landing_path: default_landing_path(),
            error_path: default_error_path(),
        }
    }
}

impl ServerConfig {
    pub fn landing_url(&self) -> String {
        format!("{}{}", self.app_base_url.trim_end_matches('/'), self.landing_path)
    }

    pub fn error_url(&self) -> String {
        format!("{}{}", self.app_base_url.trim_end_matches('/'), self.error_path)
    }
}

/// Where handshake sessions live between initiate and callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    /// SQLite table shared by every instance pointing at the same database
    Sqlite,
    /// Process memory; single-process development only
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_credentials_db")]
    pub credentials_db: String,
    #[serde(default = "default_session_backend")]
    pub session_backend: SessionBackend,
    /// Defaults to `credentials_db` when unset
    #[serde(default)]
    pub sessions_db: Option<String>,
}

fn default_credentials_db() -> String {
    "credentials.db".to_string()
}

fn default_session_backend() -> SessionBackend {
    SessionBackend::Sqlite
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials_db: default_credentials_db(),
            session_backend: default_session_backend(),
            sessions_db: None,
        }
    }
}

impl StorageConfig {
    pub fn sessions_db(&self) -> &str {
        self.sessions_db.as_deref().unwrap_or(&self.credentials_db)
    }
}

/// Handshake configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeConfig {
    /// How long an initiated handshake stays valid (seconds)
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: i64,
}

fn default_session_ttl() -> i64 {
    600
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: default_session_ttl(),
        }
    }
}

/// Token refresh configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Upper bound on any outbound provider call (seconds)
    #[serde(default = "default_refresh_timeout")]
    pub timeout_seconds: u64,
    /// When a refresh fails, hand back the last known token flagged as expired
    /// instead of failing the lookup. Callers then decide whether to prompt for
    /// reconnection.
    #[serde(default = "default_stale_token_fallback")]
    pub stale_token_fallback: bool,
}

fn default_refresh_timeout() -> u64 {
    10
}

fn default_stale_token_fallback() -> bool {
    true
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_refresh_timeout(),
            stale_token_fallback: default_stale_token_fallback(),
        }
    }
}

/// Identity extraction configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// When false every caller is the `default` user (local development)
    #[serde(default = "default_auth_enabled")]
    pub enabled: bool,
    /// Header carrying the user id, set by the hosting framework's session layer
    #[serde(default = "default_user_header")]
    pub user_header: Option<String>,
}

fn default_auth_enabled() -> bool {
    true
}

fn default_user_header() -> Option<String> {
    Some("x-user-id".to_string())
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: default_auth_enabled(),
            user_header: default_user_header(),
        }
    }
}

/// Client credentials and optional endpoint overrides for one provider
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Replaces the provider's default scope list
    pub scopes: Option<Vec<String>>,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub refresh_url: Option<String>,
    pub revoke_url: Option<String>,
}

impl VaultConfig {
    /// Loads the optional TOML file, then applies `CREDVAULT_*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => load_config(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<VaultConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: VaultConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
