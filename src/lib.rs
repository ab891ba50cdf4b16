// HTTP API
pub mod api;

// Caller identity
pub mod auth;

// TOML + environment configuration
pub mod config;

// Encrypted credential storage and lifecycle
pub mod credentials;

// Error taxonomy
pub mod error;

// Handshake, refresh and revocation against providers
pub mod oauth;

// Provider catalogue
pub mod providers;

pub use error::{Result, VaultError};
