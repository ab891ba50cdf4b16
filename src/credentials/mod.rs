//! Encrypted credential storage for integration tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialManager                  │
//! │  - get_access_token (lazy refresh)       │
//! │  - revoke (local delete + remote notify) │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - Atomic upsert on (user_id, provider)  │
//! │  - Transparent encryption/decryption     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Codec                              │
//! │  - AES-256-GCM envelopes                 │
//! │  - Unique nonce per token                │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! │  - Encrypted tokens at rest              │
//! │  - UNIQUE(user_id, provider)             │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use credvault::credentials::{Codec, CredentialStore, TokenBundle};
//! use credvault::providers::Provider;
//!
//! # fn main() -> anyhow::Result<()> {
//! let key = std::env::var("CREDVAULT_ENCRYPTION_KEY")?;
//! let store = CredentialStore::new("credentials.db", Codec::new(&key)?)?;
//!
//! let bundle = TokenBundle::bearer("ya29.access", Some("1//refresh".to_string()), Some(3600));
//! store.upsert("user1", Provider::Gmail, &bundle)?;
//!
//! if let Some(credential) = store.get("user1", Provider::Gmail)? {
//!     println!("expires at {:?}", credential.expires_at);
//! }
//!
//! store.delete("user1", Provider::Gmail)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Every token column holds a self-contained AES-256-GCM envelope
//! - Master key is provisioned externally and held in memory only
//! - Tokens are never logged; only presence flags are
//! - `Debug` output of credential types redacts token material

mod encryption;
mod manager;
mod storage;

pub use encryption::{validate_key, Codec, KEY_SIZE};
pub use manager::{CredentialManager, RevokeOutcome};
pub use storage::CredentialStore;

use crate::error::{Result, VaultError};
use crate::providers::Provider;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

/// Token type recorded for directly registered API keys
pub const API_KEY_TOKEN_TYPE: &str = "api_key";

/// Longest access token lifetime accepted from a provider (ten years)
pub const MAX_TOKEN_LIFETIME_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

/// Provider-neutral token material from a code exchange, refresh or key registration.
#[derive(Clone, PartialEq)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Per-user token of dual-token providers (the bot token is `access_token`)
    pub secondary_token: Option<String>,
    pub token_type: String,
    pub scope: String,
    /// Lifetime of `access_token` in seconds, when the provider reports one
    pub expires_in: Option<i64>,
}

impl TokenBundle {
    /// Bearer token bundle with no scope information.
    pub fn bearer(access_token: &str, refresh_token: Option<String>, expires_in: Option<i64>) -> Self {
        Self {
            access_token: access_token.to_string(),
            refresh_token,
            secondary_token: None,
            token_type: "Bearer".to_string(),
            scope: String::new(),
            expires_in,
        }
    }

    /// Non-expiring credential for a directly registered API key.
    pub fn api_key(key: &str) -> Self {
        Self {
            access_token: key.to_string(),
            refresh_token: None,
            secondary_token: None,
            token_type: API_KEY_TOKEN_TYPE.to_string(),
            scope: String::new(),
            expires_in: None,
        }
    }

    /// Absolute expiry of `access_token` when issued at `issued_at`.
    ///
    /// Lifetimes that are not positive or overflow the calendar are rejected
    /// rather than stored.
    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let Some(seconds) = self.expires_in else {
            return Ok(None);
        };
        if seconds <= 0 || seconds > MAX_TOKEN_LIFETIME_SECONDS {
            return Err(VaultError::InvalidInput(format!(
                "token lifetime of {} seconds is out of range",
                seconds
            )));
        }
        Duration::try_seconds(seconds)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .map(Some)
            .ok_or_else(|| VaultError::InvalidInput(format!("token lifetime of {} seconds overflows", seconds)))
    }
}

impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_secondary_token", &self.secondary_token.is_some())
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// A decrypted credential row.
#[derive(Clone)]
pub struct Credential {
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub secondary_token: Option<String>,
    pub token_type: String,
    pub scope: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Expiry is inclusive: a token whose `expires_at` equals `now` is expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_secondary_token", &self.secondary_token.is_some())
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of an access token lookup for a connected provider.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub token_type: String,
    pub secondary_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// True when the token is past its expiry and could not be refreshed.
    /// Callers decide whether to try it anyway or prompt for reconnection.
    pub is_expired: bool,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("is_expired", &self.is_expired)
            .finish()
    }
}

/// Token-free description of a stored credential
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionSummary {
    pub provider: Provider,
    pub token_type: String,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
