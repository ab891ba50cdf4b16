//! Provider catalogue.
//!
//! Every integration is a variant of the closed [`Provider`] enumeration and has
//! exactly one static [`ProviderProfile`] describing how its authorization-code
//! flow, refresh and revocation behave. The handshake coordinator and refresh
//! dispatcher only ever consult these records, so adding a provider never means
//! adding a bespoke handler.

mod registry;

pub use registry::{ProviderConfig, ProviderRegistry};

use crate::error::VaultError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported third-party integrations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gmail,
    GoogleCalendar,
    GoogleDrive,
    GoogleSheets,
    Slack,
    Airtable,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::Gmail,
        Provider::GoogleCalendar,
        Provider::GoogleDrive,
        Provider::GoogleSheets,
        Provider::Slack,
        Provider::Airtable,
    ];

    /// Identifier used in URLs, storage rows and environment variables.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::GoogleCalendar => "google_calendar",
            Provider::GoogleDrive => "google_drive",
            Provider::GoogleSheets => "google_sheets",
            Provider::Slack => "slack",
            Provider::Airtable => "airtable",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Gmail => "Gmail",
            Provider::GoogleCalendar => "Google Calendar",
            Provider::GoogleDrive => "Google Drive",
            Provider::GoogleSheets => "Google Sheets",
            Provider::Slack => "Slack",
            Provider::Airtable => "Airtable",
        }
    }

    pub fn profile(&self) -> &'static ProviderProfile {
        match self {
            Provider::Gmail => &GMAIL,
            Provider::GoogleCalendar => &GOOGLE_CALENDAR,
            Provider::GoogleDrive => &GOOGLE_DRIVE,
            Provider::GoogleSheets => &GOOGLE_SHEETS,
            Provider::Slack => &SLACK,
            Provider::Airtable => &AIRTABLE,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| VaultError::UnsupportedProvider(format!("unknown provider '{}'", s)))
    }
}

/// Authorization-code variant spoken by a provider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantVariant {
    /// Plain authorization code exchange
    Standard,
    /// Authorization code bound to an S256 code verifier
    Pkce,
    /// One callback yields a workspace (bot) token plus a per-user token
    DualToken,
}

/// How client credentials are presented to the token endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientAuth {
    /// `client_id` / `client_secret` form fields
    RequestBody,
    /// HTTP Basic `Authorization` header
    BasicHeader,
}

/// How a token is handed to the provider's revocation endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevocationStyle {
    /// POST form field `token=...`
    FormToken,
    /// POST with `Authorization: Bearer <token>`
    BearerToken,
}

#[derive(Clone, Copy, Debug)]
pub struct RevocationEndpoint {
    pub url: &'static str,
    pub style: RevocationStyle,
}

/// Static capability record for one provider.
#[derive(Debug)]
pub struct ProviderProfile {
    pub provider: Provider,
    pub auth_url: &'static str,
    pub token_url: &'static str,
    /// `None` when issued tokens never expire.
    pub refresh_url: Option<&'static str>,
    pub revocation: Option<RevocationEndpoint>,
    pub scopes: &'static [&'static str],
    pub scope_separator: &'static str,
    /// Per-user scopes, only meaningful for [`GrantVariant::DualToken`].
    pub user_scopes: &'static [&'static str],
    pub variant: GrantVariant,
    pub client_auth: ClientAuth,
    pub extra_auth_params: &'static [(&'static str, &'static str)],
    /// Whether a user may register a personal API key instead of running the handshake.
    pub accepts_api_key: bool,
}

impl ProviderProfile {
    pub fn requires_pkce(&self) -> bool {
        self.variant == GrantVariant::Pkce
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_url.is_some()
    }

    pub fn is_revocable(&self) -> bool {
        self.revocation.is_some()
    }
}

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

// Offline access plus forced consent so Google always issues a refresh token.
const GOOGLE_AUTH_PARAMS: &[(&str, &str)] = &[
    ("access_type", "offline"),
    ("prompt", "consent"),
    ("include_granted_scopes", "true"),
];

const fn google(provider: Provider, scopes: &'static [&'static str]) -> ProviderProfile {
    ProviderProfile {
        provider,
        auth_url: GOOGLE_AUTH_URL,
        token_url: GOOGLE_TOKEN_URL,
        refresh_url: Some(GOOGLE_TOKEN_URL),
        revocation: Some(RevocationEndpoint {
            url: GOOGLE_REVOKE_URL,
            style: RevocationStyle::FormToken,
        }),
        scopes,
        scope_separator: " ",
        user_scopes: &[],
        variant: GrantVariant::Standard,
        client_auth: ClientAuth::RequestBody,
        extra_auth_params: GOOGLE_AUTH_PARAMS,
        accepts_api_key: false,
    }
}

static GMAIL: ProviderProfile = google(
    Provider::Gmail,
    &[
        "https://www.googleapis.com/auth/gmail.readonly",
        "https://www.googleapis.com/auth/gmail.send",
        "https://www.googleapis.com/auth/gmail.modify",
    ],
);

static GOOGLE_CALENDAR: ProviderProfile = google(
    Provider::GoogleCalendar,
    &[
        "https://www.googleapis.com/auth/calendar.readonly",
        "https://www.googleapis.com/auth/calendar.events",
    ],
);

static GOOGLE_DRIVE: ProviderProfile = google(
    Provider::GoogleDrive,
    &[
        "https://www.googleapis.com/auth/drive.readonly",
        "https://www.googleapis.com/auth/drive.file",
    ],
);

static GOOGLE_SHEETS: ProviderProfile = google(
    Provider::GoogleSheets,
    &["https://www.googleapis.com/auth/spreadsheets"],
);

static SLACK: ProviderProfile = ProviderProfile {
    provider: Provider::Slack,
    auth_url: "https://slack.com/oauth/v2/authorize",
    token_url: "https://slack.com/api/oauth.v2.access",
    refresh_url: None,
    revocation: Some(RevocationEndpoint {
        url: "https://slack.com/api/auth.revoke",
        style: RevocationStyle::BearerToken,
    }),
    scopes: &["channels:read", "channels:history", "chat:write", "users:read"],
    scope_separator: ",",
    user_scopes: &["search:read", "chat:write"],
    variant: GrantVariant::DualToken,
    client_auth: ClientAuth::RequestBody,
    extra_auth_params: &[],
    accepts_api_key: false,
};

static AIRTABLE: ProviderProfile = ProviderProfile {
    provider: Provider::Airtable,
    auth_url: "https://airtable.com/oauth2/v1/authorize",
    token_url: "https://airtable.com/oauth2/v1/token",
    refresh_url: Some("https://airtable.com/oauth2/v1/token"),
    revocation: None,
    scopes: &["data.records:read", "data.records:write", "schema.bases:read"],
    scope_separator: " ",
    user_scopes: &[],
    variant: GrantVariant::Pkce,
    client_auth: ClientAuth::BasicHeader,
    extra_auth_params: &[],
    accepts_api_key: true,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names_round_trip() {
        for provider in Provider::ALL {
            let parsed: Provider = provider.as_str().parse().unwrap();
            assert_eq!(parsed, provider);
            assert_eq!(provider.profile().provider, provider);
        }
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!("github".parse::<Provider>().is_err());
        assert!("".parse::<Provider>().is_err());
        assert!("Gmail".parse::<Provider>().is_err());
    }

    #[test]
    fn test_serde_matches_url_identifier() {
        let json = serde_json::to_string(&Provider::GoogleSheets).unwrap();
        assert_eq!(json, "\"google_sheets\"");
    }

    #[test]
    fn test_capabilities() {
        assert!(Provider::Airtable.profile().requires_pkce());
        assert!(!Provider::Gmail.profile().requires_pkce());

        assert!(!Provider::Slack.profile().is_refreshable());
        assert_eq!(Provider::Slack.profile().variant, GrantVariant::DualToken);

        assert!(Provider::GoogleDrive.profile().is_revocable());
        assert!(!Provider::Airtable.profile().is_revocable());
    }
}
