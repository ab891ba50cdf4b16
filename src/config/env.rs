use super::{SessionBackend, VaultConfig};
use crate::providers::Provider;

impl VaultConfig {
    /// Applies `CREDVAULT_*` overrides read through `lookup`.
    ///
    /// Unparsable values are ignored and the file/default value kept.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CREDVAULT_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = lookup("CREDVAULT_CALLBACK_BASE_URL") {
            self.server.callback_base_url = v;
        }
        if let Some(v) = lookup("CREDVAULT_APP_BASE_URL") {
            self.server.app_base_url = v;
        }
        if let Some(v) = lookup("CREDVAULT_CREDENTIALS_DB") {
            self.storage.credentials_db = v;
        }
        if let Some(v) = lookup("CREDVAULT_SESSIONS_DB") {
            self.storage.sessions_db = Some(v);
        }
        if let Some(v) = lookup("CREDVAULT_SESSION_BACKEND") {
            match v.as_str() {
                "sqlite" => self.storage.session_backend = SessionBackend::Sqlite,
                "memory" => self.storage.session_backend = SessionBackend::Memory,
                _ => {}
            }
        }
        if let Some(v) = lookup("CREDVAULT_SESSION_TTL_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                self.handshake.session_ttl_seconds = n;
            }
        }
        if let Some(v) = lookup("CREDVAULT_REFRESH_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.refresh.timeout_seconds = n;
            }
        }
        if let Some(v) = lookup("CREDVAULT_STALE_TOKEN_FALLBACK") {
            if let Ok(b) = v.parse::<bool>() {
                self.refresh.stale_token_fallback = b;
            }
        }
        if let Some(v) = lookup("CREDVAULT_AUTH_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                self.auth.enabled = b;
            }
        }

        for provider in Provider::ALL {
            let prefix = format!("CREDVAULT_OAUTH_{}", provider.as_str().to_uppercase());
            let client_id = lookup(&format!("{}_CLIENT_ID", prefix));
            let client_secret = lookup(&format!("{}_CLIENT_SECRET", prefix));
            if client_id.is_none() && client_secret.is_none() {
                continue;
            }

            let settings = self
                .providers
                .entry(provider.as_str().to_string())
                .or_default();
            if client_id.is_some() {
                settings.client_id = client_id;
            }
            if client_secret.is_some() {
                settings.client_secret = client_secret;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = VaultConfig::default();
        config.apply_env_from(lookup_from(&[
            ("CREDVAULT_BIND_ADDR", "127.0.0.1:9000"),
            ("CREDVAULT_CREDENTIALS_DB", "/tmp/creds.db"),
            ("CREDVAULT_SESSION_BACKEND", "memory"),
            ("CREDVAULT_SESSION_TTL_SECONDS", "60"),
            ("CREDVAULT_STALE_TOKEN_FALLBACK", "false"),
        ]));

        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.storage.credentials_db, "/tmp/creds.db");
        assert_eq!(config.storage.session_backend, SessionBackend::Memory);
        assert_eq!(config.handshake.session_ttl_seconds, 60);
        assert!(!config.refresh.stale_token_fallback);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let mut config = VaultConfig::default();
        config.apply_env_from(lookup_from(&[
            ("CREDVAULT_SESSION_TTL_SECONDS", "ten minutes"),
            ("CREDVAULT_SESSION_BACKEND", "redis"),
            ("CREDVAULT_AUTH_ENABLED", "maybe"),
        ]));

        assert_eq!(config.handshake.session_ttl_seconds, 600);
        assert_eq!(config.storage.session_backend, SessionBackend::Sqlite);
        assert!(config.auth.enabled);
    }

    #[test]
    fn test_provider_credentials_from_env() {
        let mut config = VaultConfig::default();
        config.apply_env_from(lookup_from(&[
            ("CREDVAULT_OAUTH_GOOGLE_SHEETS_CLIENT_ID", "sheets-id"),
            ("CREDVAULT_OAUTH_GOOGLE_SHEETS_CLIENT_SECRET", "sheets-secret"),
        ]));

        let sheets = &config.providers["google_sheets"];
        assert_eq!(sheets.client_id.as_deref(), Some("sheets-id"));
        assert_eq!(sheets.client_secret.as_deref(), Some("sheets-secret"));
        assert!(!config.providers.contains_key("gmail"));
    }

    #[test]
    fn test_env_secret_keeps_file_scopes() {
        let mut config: VaultConfig = toml::from_str(
            r#"
            [providers.slack]
            client_id = "file-id"
            scopes = ["chat:write"]
            "#,
        )
        .unwrap();

        config.apply_env_from(lookup_from(&[("CREDVAULT_OAUTH_SLACK_CLIENT_SECRET", "env-secret")]));

        let slack = &config.providers["slack"];
        assert_eq!(slack.client_id.as_deref(), Some("file-id"));
        assert_eq!(slack.client_secret.as_deref(), Some("env-secret"));
        assert_eq!(slack.scopes.as_ref().unwrap(), &vec!["chat:write".to_string()]);
    }
}
