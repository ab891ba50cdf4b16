//! Caller identity.
//!
//! credvault does not authenticate users itself. The hosting application's
//! session layer forwards the user id, either in a trusted header or as the
//! bearer token of the request.

use crate::config::AuthConfig;
use axum::http::HeaderMap;


/// User every request maps to when identity checks are disabled
pub const DEFAULT_USER: &str = "default";

/// Resolves the user id of a request.
///
/// Order: configured user header, then `Authorization: Bearer <user>`. With
/// `auth.enabled = false` every caller is [`DEFAULT_USER`].
pub fn resolve_user_id(headers: &HeaderMap, config: &AuthConfig) -> Result<String, IdentityError> {
    if !config.enabled {
        return Ok(DEFAULT_USER.to_string());
    }

    if let Some(header) = config.user_header.as_deref() {
        if let Some(value) = headers.get(header) {
            let user_id = value
                .to_str()
                .map_err(|_| IdentityError::InvalidFormat)?
                .trim();
            if user_id.is_empty() {
                return Err(IdentityError::Empty);
            }
            return Ok(user_id.to_string());
        }
    }

    extract_bearer_token(headers)
}

/// Like [`resolve_user_id`], with every failure collapsed to `None`.
pub fn optional_user_id(headers: &HeaderMap, config: &AuthConfig) -> Option<String> {
    resolve_user_id(headers, config).ok()
}

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, IdentityError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(IdentityError::Missing)?
        .to_str()
        .map_err(|_| IdentityError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

fn parse_bearer_token(header_value: &str) -> Result<String, IdentityError> {
    let (scheme, token) = header_value
        .split_once(' ')
        .ok_or(IdentityError::InvalidFormat)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(IdentityError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(IdentityError::Empty);
    }

    Ok(token.to_string())
}

/// Identity extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum IdentityError {
    /// Neither the user header nor an Authorization header is present
    Missing,
    /// Not valid header text, or not "Bearer <user>"
    InvalidFormat,
    /// Header present but blank
    Empty,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Missing => write!(f, "User identity not provided"),
            IdentityError::InvalidFormat => write!(f, "Invalid user identity format"),
            IdentityError::Empty => write!(f, "User identity is empty"),
        }
    }
}

impl std::error::Error for IdentityError {}
