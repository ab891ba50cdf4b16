//! OAuth token endpoint calls.
//!
//! Handles exchanging authorization codes for tokens and the token response
//! shapes shared with refresh.

use crate::credentials::{TokenBundle, MAX_TOKEN_LIFETIME_SECONDS};
use crate::error::{Result, VaultError};
use crate::providers::{ClientAuth, GrantVariant, Provider, ProviderConfig};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use tracing::debug;

/// Per-user token block of a dual-token response
#[derive(Deserialize, Debug, Default)]
pub(crate) struct AuthedUser {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// OAuth token response.
///
/// Covers standard OAuth 2.0 responses and the dual-token shape that reports
/// failures as `200 {"ok": false, "error": ...}`.
#[derive(Deserialize, Debug)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub authed_user: Option<AuthedUser>,
}

impl TokenResponse {
    /// Converts the response into a bundle, or returns the reason it is unusable.
    pub(crate) fn into_bundle(self, variant: GrantVariant) -> std::result::Result<TokenBundle, String> {
        if self.ok == Some(false) {
            return Err(self.error.unwrap_or_else(|| "ok=false".to_string()));
        }

        let (user_token, user_scope) = match self.authed_user {
            Some(user) => (user.access_token, user.scope),
            None => (None, None),
        };
        let (access_token, secondary_token) = match (variant, self.access_token) {
            (GrantVariant::DualToken, Some(bot)) => (bot, user_token),
            // User-only install: the per-user token is all there is
            (GrantVariant::DualToken, None) => match user_token {
                Some(user) => (user, None),
                None => return Err("response carried no access token".to_string()),
            },
            (_, Some(token)) => (token, None),
            (_, None) => return Err("response carried no access token".to_string()),
        };

        if access_token.is_empty() {
            return Err("response carried an empty access token".to_string());
        }

        if let Some(seconds) = self.expires_in {
            if seconds <= 0 || seconds > MAX_TOKEN_LIFETIME_SECONDS {
                return Err(format!("response carried an unusable expires_in of {}", seconds));
            }
        }

        let scope = match variant {
            GrantVariant::DualToken => join_scopes(self.scope.as_deref(), user_scope.as_deref()),
            _ => self.scope.unwrap_or_default(),
        };

        Ok(TokenBundle {
            access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            secondary_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope,
            expires_in: self.expires_in,
        })
    }
}

/// Workspace scopes followed by the per-user scopes not already granted.
fn join_scopes(bot: Option<&str>, user: Option<&str>) -> String {
    let mut scopes: Vec<&str> = Vec::new();
    for scope in bot
        .into_iter()
        .chain(user)
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        if !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }
    scopes.join(",")
}

/// Accepts `expires_in` as a JSON number or a numeric string.
fn lenient_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(i64),
        Text(String),
    }

    match Option::<Seconds>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Seconds::Number(n)) => Ok(Some(n)),
        Some(Seconds::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom("expires_in is not a whole number of seconds")),
    }
}

/// Builds a token endpoint POST with client credentials attached the way the
/// provider expects them.
pub(crate) fn token_request(
    client: &reqwest::Client,
    url: &str,
    config: &ProviderConfig,
    mut form: Vec<(&'static str, String)>,
) -> reqwest::RequestBuilder {
    let request = client.post(url).header("Accept", "application/json");

    match config.profile.client_auth {
        ClientAuth::BasicHeader => {
            form.push(("client_id", config.client_id.clone()));
            request
                .basic_auth(&config.client_id, Some(&config.client_secret))
                .form(&form)
        }
        ClientAuth::RequestBody => {
            form.push(("client_id", config.client_id.clone()));
            form.push(("client_secret", config.client_secret.clone()));
            request.form(&form)
        }
    }
}

/// Sends a token request and parses the body, flattening every failure into a
/// provider payload string.
pub(crate) async fn send_token_request(
    request: reqwest::RequestBuilder,
    variant: GrantVariant,
) -> std::result::Result<TokenBundle, String> {
    let response = request
        .send()
        .await
        .map_err(|e| format!("request failed: {}", e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| format!("failed to read response body: {}", e))?;

    if !status.is_success() {
        return Err(format!("status {}: {}", status, body));
    }

    // A 2xx body may hold live tokens, so only the parse position is reported
    let token_response: TokenResponse = serde_json::from_str(&body).map_err(|e| {
        format!(
            "unparsable token response ({:?} error at line {} column {})",
            e.classify(),
            e.line(),
            e.column()
        )
    })?;

    token_response.into_bundle(variant)
}

/// Exchange authorization code for tokens
///
/// `redirect_uri` must be the exact URI used to build the authorization URL.
/// `code_verifier` is sent for PKCE providers.
pub async fn exchange_code(
    client: &reqwest::Client,
    config: &ProviderConfig,
    code: &str,
    redirect_uri: &str,
    code_verifier: Option<&str>,
) -> Result<TokenBundle> {
    let provider: Provider = config.provider();

    let mut form = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("redirect_uri", redirect_uri.to_string()),
    ];
    if let Some(verifier) = code_verifier {
        form.push(("code_verifier", verifier.to_string()));
    }

    debug!(provider = %provider, token_url = %config.token_url, "Exchanging authorization code for token");

    let request = token_request(client, &config.token_url, config, form);
    let bundle = send_token_request(request, config.profile.variant)
        .await
        .map_err(|payload| VaultError::TokenExchange { provider, payload })?;

    debug!(
        provider = %provider,
        has_refresh_token = bundle.refresh_token.is_some(),
        has_secondary_token = bundle.secondary_token.is_some(),
        expires_in = ?bundle.expires_in,
        "Token exchange successful"
    );

    Ok(bundle)
}
