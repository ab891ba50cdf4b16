//! Error taxonomy for the credential lifecycle.

use crate::providers::Provider;
use thiserror::Error;

/// Message shown for every rejected handshake, whatever the underlying cause.
///
/// Forgery, replay and staleness are deliberately indistinguishable to the user.
pub const HANDSHAKE_RETRY_MESSAGE: &str =
    "Your connection attempt expired or could not be verified. Please try connecting again.";

/// Credential lifecycle errors
#[derive(Error, Debug)]
pub enum VaultError {
    /// Bad or missing encryption key or provider client credentials. Not retryable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Stored ciphertext is corrupted or was written under another key.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// State mismatch, missing verifier, missing or expired session.
    #[error("Handshake rejected: {0}")]
    HandshakeState(String),

    /// Provider rejected the authorization code.
    #[error("Token exchange with {provider} failed: {payload}")]
    TokenExchange { provider: Provider, payload: String },

    /// Provider rejected the refresh token, or the refresh call timed out.
    #[error("Token refresh with {provider} failed: {payload}")]
    RefreshFailed { provider: Provider, payload: String },

    /// User declined, or the provider reported an error on the callback.
    #[error("Authorization with {provider} was not granted: {reason}")]
    AuthorizationDenied { provider: Provider, reason: String },

    /// Provider refused or failed a remote revocation call.
    #[error("Remote revocation with {provider} failed: {payload}")]
    Revocation { provider: Provider, payload: String },

    /// Provider has no profile entry for the requested operation.
    #[error("Unsupported provider operation: {0}")]
    UnsupportedProvider(String),

    /// Caller supplied an unusable value (e.g. an empty API key).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl VaultError {
    /// Human-readable text suitable for a redirect `message` or UI banner.
    pub fn user_message(&self) -> String {
        match self {
            VaultError::HandshakeState(_) => HANDSHAKE_RETRY_MESSAGE.to_string(),
            VaultError::Decryption(_) => {
                "This integration was disconnected. Please reconnect it.".to_string()
            }
            VaultError::TokenExchange { provider, .. }
            | VaultError::RefreshFailed { provider, .. } => format!(
                "{} did not accept the authorization. Please reconnect.",
                provider.display_name()
            ),
            VaultError::AuthorizationDenied { reason, .. } => reason.clone(),
            VaultError::Revocation { provider, .. } => format!(
                "{} could not be notified of the disconnection.",
                provider.display_name()
            ),
            VaultError::Configuration(_) | VaultError::UnsupportedProvider(_) => {
                "This integration is not available right now.".to_string()
            }
            VaultError::InvalidInput(msg) => msg.clone(),
            VaultError::Storage(_) => "Something went wrong. Please try again.".to_string(),
        }
    }

    /// True when the user must run the handshake again to recover.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            VaultError::Decryption(_)
                | VaultError::HandshakeState(_)
                | VaultError::TokenExchange { .. }
                | VaultError::RefreshFailed { .. }
        )
    }
}

/// Result type alias for credential operations
pub type Result<T> = std::result::Result<T, VaultError>;
