//! Credential lifecycle on top of the store: lazy refresh, revocation and
//! direct key registration.

use super::{AccessToken, ConnectionSummary, Credential, CredentialStore, TokenBundle};
use crate::error::{Result, VaultError};
use crate::oauth::{TokenRefresher, TokenRevoker};
use crate::providers::Provider;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a revocation actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevokeOutcome {
    /// A local credential row existed and was deleted
    pub removed: bool,
    /// The provider acknowledged the remote revocation
    pub remote_notified: bool,
}

pub struct CredentialManager {
    store: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    revoker: Arc<dyn TokenRevoker>,
    stale_token_fallback: bool,
}

impl CredentialManager {
    pub fn new(
        store: Arc<CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        revoker: Arc<dyn TokenRevoker>,
    ) -> Self {
        Self {
            store,
            refresher,
            revoker,
            stale_token_fallback: true,
        }
    }

    /// When off, a failed refresh is returned as an error instead of the last
    /// known token flagged as expired.
    pub fn with_stale_token_fallback(mut self, enabled: bool) -> Self {
        self.stale_token_fallback = enabled;
        self
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Returns a usable access token, refreshing it first when it has expired.
    ///
    /// `Ok(None)` means the provider is not connected for this user.
    pub async fn get_access_token(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<AccessToken>> {
        self.get_access_token_at(user_id, provider, Utc::now()).await
    }

    pub async fn get_access_token_at(
        &self,
        user_id: &str,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessToken>> {
        let Some(credential) = self.store.get(user_id, provider)? else {
            return Ok(None);
        };

        if !credential.is_expired_at(now) {
            return Ok(Some(current(&credential)));
        }

        if credential.refresh_token.is_none() || !provider.profile().is_refreshable() {
            debug!(user_id = %user_id, provider = %provider, "Token expired and cannot be refreshed");
            return Ok(Some(stale(&credential)));
        }

        match self.refresher.refresh(&credential).await {
            Ok(bundle) => {
                let expires_at = self.store.upsert_at(user_id, provider, &bundle, now)?;
                info!(user_id = %user_id, provider = %provider, "Access token refreshed");
                Ok(Some(AccessToken {
                    token: bundle.access_token,
                    token_type: bundle.token_type,
                    secondary_token: bundle.secondary_token,
                    expires_at,
                    is_expired: false,
                }))
            }
            Err(e @ VaultError::RefreshFailed { .. }) if self.stale_token_fallback => {
                warn!(
                    user_id = %user_id,
                    provider = %provider,
                    error = %e,
                    "Refresh failed, returning last known token as expired"
                );
                Ok(Some(stale(&credential)))
            }
            Err(VaultError::UnsupportedProvider(reason)) => {
                debug!(user_id = %user_id, provider = %provider, reason = %reason, "Refresh not possible");
                Ok(Some(stale(&credential)))
            }
            Err(e) => Err(e),
        }
    }

    /// Disconnects a provider: deletes the local credential, then tells the
    /// provider on a best-effort basis.
    ///
    /// Revoking something that is not connected succeeds and does nothing.
    pub async fn revoke(&self, user_id: &str, provider: Provider) -> Result<RevokeOutcome> {
        // An undecryptable row is still deleted; there is just nothing to send remotely
        let credential = match self.store.get(user_id, provider) {
            Ok(credential) => credential,
            Err(VaultError::Decryption(reason)) => {
                warn!(user_id = %user_id, provider = %provider, reason = %reason, "Revoking undecryptable credential");
                None
            }
            Err(e) => return Err(e),
        };

        let removed = self.store.delete(user_id, provider)?;

        let remote_notified = match credential {
            Some(credential) if provider.profile().is_revocable() => {
                match self.revoker.revoke(&credential).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            user_id = %user_id,
                            provider = %provider,
                            error = %e,
                            "Remote revocation failed; local credential already removed"
                        );
                        false
                    }
                }
            }
            _ => false,
        };

        info!(
            user_id = %user_id,
            provider = %provider,
            removed = removed,
            remote_notified = remote_notified,
            "Integration revoked"
        );

        Ok(RevokeOutcome {
            removed,
            remote_notified,
        })
    }

    /// Stores a personal API key as a non-expiring credential.
    pub fn register_key(&self, user_id: &str, provider: Provider, key: &str) -> Result<()> {
        if !provider.profile().accepts_api_key {
            return Err(VaultError::UnsupportedProvider(format!(
                "{} does not accept API keys",
                provider
            )));
        }

        let key = key.trim();
        if key.is_empty() {
            return Err(VaultError::InvalidInput("API key must not be empty".to_string()));
        }

        self.store.upsert(user_id, provider, &TokenBundle::api_key(key))?;
        info!(user_id = %user_id, provider = %provider, "API key registered");
        Ok(())
    }

    /// Connected providers for a user, without token material.
    pub fn connections(&self, user_id: &str) -> Result<Vec<ConnectionSummary>> {
        self.store.list_by_user(user_id)
    }
}

fn current(credential: &Credential) -> AccessToken {
    AccessToken {
        token: credential.access_token.clone(),
        token_type: credential.token_type.clone(),
        secondary_token: credential.secondary_token.clone(),
        expires_at: credential.expires_at,
        is_expired: false,
    }
}

fn stale(credential: &Credential) -> AccessToken {
    AccessToken {
        is_expired: true,
        ..current(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Codec, API_KEY_TOKEN_TYPE};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Refresher returning a canned bundle and counting calls
    struct FakeRefresher {
        calls: AtomicUsize,
        bundle: Mutex<Option<TokenBundle>>,
    }

    impl FakeRefresher {
        fn succeeding(bundle: TokenBundle) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                bundle: Mutex::new(Some(bundle)),
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                bundle: Mutex::new(None),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, credential: &Credential) -> Result<TokenBundle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.bundle.lock().unwrap().take() {
                Some(fresh) => Ok(TokenBundle {
                    refresh_token: fresh.refresh_token.or_else(|| credential.refresh_token.clone()),
                    ..fresh
                }),
                None => Err(VaultError::RefreshFailed {
                    provider: credential.provider,
                    payload: r#"{"error":"invalid_grant"}"#.to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct FakeRevoker {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TokenRevoker for FakeRevoker {
        async fn revoke(&self, credential: &Credential) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(VaultError::Revocation {
                    provider: credential.provider,
                    payload: "status 503".to_string(),
                });
            }
            Ok(())
        }
    }

    fn store() -> Arc<CredentialStore> {
        Arc::new(CredentialStore::new(":memory:", Codec::from_key_bytes(&[5u8; 32]).unwrap()).unwrap())
    }

    fn manager(
        store: Arc<CredentialStore>,
        refresher: Arc<FakeRefresher>,
        revoker: Arc<FakeRevoker>,
    ) -> CredentialManager {
        CredentialManager::new(store, refresher, revoker)
    }

    fn gmail_bundle(expires_in: i64) -> TokenBundle {
        TokenBundle::bearer("old-access", Some("refresh-1".to_string()), Some(expires_in))
    }

    #[tokio::test]
    async fn test_not_connected_is_none() {
        let m = manager(store(), Arc::new(FakeRefresher::failing()), Arc::default());
        assert!(m.get_access_token("alice", Provider::Gmail).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unexpired_token_returned_without_refresh() {
        let store = store();
        let refresher = Arc::new(FakeRefresher::failing());
        let now = Utc::now();
        store.upsert_at("alice", Provider::Gmail, &gmail_bundle(3600), now).unwrap();

        let m = manager(store, refresher.clone(), Arc::default());
        let token = m
            .get_access_token_at("alice", Provider::Gmail, now + Duration::seconds(3599))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(token.token, "old-access");
        assert!(!token.is_expired);
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_after_expiry_happens_exactly_once() {
        let store = store();
        let t0 = Utc::now();
        store.upsert_at("alice", Provider::Gmail, &gmail_bundle(3600), t0).unwrap();

        let refresher = Arc::new(FakeRefresher::succeeding(TokenBundle::bearer(
            "new-access",
            None,
            Some(3600),
        )));
        let m = manager(store.clone(), refresher.clone(), Arc::default());

        let at = t0 + Duration::seconds(3601);
        let token = m
            .get_access_token_at("alice", Provider::Gmail, at)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(token.token, "new-access");
        assert!(!token.is_expired);
        assert_eq!(refresher.calls(), 1);

        let stored = store.get("alice", Provider::Gmail).unwrap().unwrap();
        assert_eq!(stored.access_token, "new-access");
        assert!(stored.expires_at.unwrap() > t0 + Duration::seconds(3600));
        // Not rotated by the provider, so still the original
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));

        // Second lookup uses the refreshed token
        let again = m
            .get_access_token_at("alice", Provider::Gmail, at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.token, "new-access");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_refreshed_expiry_matches_stored_row() {
        let store = store();
        let t0 = Utc::now();
        store.upsert_at("alice", Provider::Gmail, &gmail_bundle(60), t0).unwrap();

        let refresher = Arc::new(FakeRefresher::succeeding(TokenBundle::bearer(
            "new-access",
            None,
            Some(1800),
        )));
        let m = manager(store.clone(), refresher, Arc::default());

        let at = t0 + Duration::seconds(61);
        let token = m
            .get_access_token_at("alice", Provider::Gmail, at)
            .await
            .unwrap()
            .unwrap();

        let stored = store.get("alice", Provider::Gmail).unwrap().unwrap();
        assert_eq!(token.expires_at, Some(at + Duration::seconds(1800)));
        assert_eq!(
            token.expires_at.map(|e| e.timestamp()),
            stored.expires_at.map(|e| e.timestamp())
        );
    }

    #[tokio::test]
    async fn test_refresh_with_unusable_lifetime_keeps_old_row() {
        let store = store();
        let t0 = Utc::now();
        store.upsert_at("alice", Provider::Gmail, &gmail_bundle(60), t0).unwrap();

        let refresher = Arc::new(FakeRefresher::succeeding(TokenBundle::bearer(
            "new-access",
            None,
            Some(i64::MAX),
        )));
        let m = manager(store.clone(), refresher, Arc::default());

        let result = m
            .get_access_token_at("alice", Provider::Gmail, t0 + Duration::seconds(61))
            .await;
        assert!(matches!(result, Err(VaultError::InvalidInput(_))));

        let stored = store.get("alice", Provider::Gmail).unwrap().unwrap();
        assert_eq!(stored.access_token, "old-access");
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_inclusive() {
        let store = store();
        let t0 = Utc::now();
        store.upsert_at("alice", Provider::Gmail, &gmail_bundle(3600), t0).unwrap();

        let refresher = Arc::new(FakeRefresher::succeeding(TokenBundle::bearer(
            "new-access",
            None,
            Some(3600),
        )));
        let m = manager(store, refresher.clone(), Arc::default());

        // expires_at == now counts as expired
        m.get_access_token_at("alice", Provider::Gmail, t0 + Duration::seconds(3600))
            .await
            .unwrap();
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_falls_back_to_stale_token() {
        let store = store();
        let t0 = Utc::now();
        store.upsert_at("alice", Provider::Gmail, &gmail_bundle(60), t0).unwrap();

        let m = manager(store, Arc::new(FakeRefresher::failing()), Arc::default());
        let token = m
            .get_access_token_at("alice", Provider::Gmail, t0 + Duration::seconds(120))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(token.token, "old-access");
        assert!(token.is_expired);
    }

    #[tokio::test]
    async fn test_refresh_failure_without_fallback_is_error() {
        let store = store();
        let t0 = Utc::now();
        store.upsert_at("alice", Provider::Gmail, &gmail_bundle(60), t0).unwrap();

        let m = manager(store, Arc::new(FakeRefresher::failing()), Arc::default())
            .with_stale_token_fallback(false);

        let err = m
            .get_access_token_at("alice", Provider::Gmail, t0 + Duration::seconds(120))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::RefreshFailed { .. }));
        assert!(err.requires_reconnect());
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_is_stale() {
        let store = store();
        let t0 = Utc::now();
        store
            .upsert_at("alice", Provider::Gmail, &TokenBundle::bearer("only", None, Some(60)), t0)
            .unwrap();

        let refresher = Arc::new(FakeRefresher::failing());
        let m = manager(store, refresher.clone(), Arc::default());
        let token = m
            .get_access_token_at("alice", Provider::Gmail, t0 + Duration::seconds(61))
            .await
            .unwrap()
            .unwrap();

        assert!(token.is_expired);
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_undecryptable_row_is_decryption_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");
        {
            let old = CredentialStore::new(&path, Codec::from_key_bytes(&[1u8; 32]).unwrap()).unwrap();
            old.upsert("alice", Provider::Gmail, &gmail_bundle(3600)).unwrap();
        }
        let store = Arc::new(CredentialStore::new(&path, Codec::from_key_bytes(&[2u8; 32]).unwrap()).unwrap());

        let m = manager(store, Arc::new(FakeRefresher::failing()), Arc::default());
        let err = m.get_access_token("alice", Provider::Gmail).await.unwrap_err();
        assert!(matches!(err, VaultError::Decryption(_)));

        // Still revocable: the row is removed even though it cannot be read
        let outcome = m.revoke("alice", Provider::Gmail).await.unwrap();
        assert!(outcome.removed);
        assert!(!outcome.remote_notified);
    }

    #[tokio::test]
    async fn test_revoke_absent_credential_is_noop() {
        let revoker = Arc::new(FakeRevoker::default());
        let m = manager(store(), Arc::new(FakeRefresher::failing()), revoker.clone());

        let outcome = m.revoke("alice", Provider::Gmail).await.unwrap();
        assert_eq!(
            outcome,
            RevokeOutcome {
                removed: false,
                remote_notified: false
            }
        );
        assert_eq!(revoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_revoke_deletes_and_notifies() {
        let store = store();
        store.upsert("alice", Provider::Gmail, &gmail_bundle(3600)).unwrap();
        let revoker = Arc::new(FakeRevoker::default());
        let m = manager(store.clone(), Arc::new(FakeRefresher::failing()), revoker.clone());

        let outcome = m.revoke("alice", Provider::Gmail).await.unwrap();
        assert!(outcome.removed);
        assert!(outcome.remote_notified);
        assert!(store.get("alice", Provider::Gmail).unwrap().is_none());
        assert_eq!(revoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_failure_does_not_block_local_delete() {
        let store = store();
        store.upsert("alice", Provider::Slack, &TokenBundle::bearer("xoxb", None, None)).unwrap();
        let revoker = Arc::new(FakeRevoker {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let m = manager(store.clone(), Arc::new(FakeRefresher::failing()), revoker);

        let outcome = m.revoke("alice", Provider::Slack).await.unwrap();
        assert!(outcome.removed);
        assert!(!outcome.remote_notified);
        assert!(store.get("alice", Provider::Slack).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_revocable_provider_only_deletes_locally() {
        let store = store();
        store.upsert("alice", Provider::Airtable, &gmail_bundle(3600)).unwrap();
        let revoker = Arc::new(FakeRevoker::default());
        let m = manager(store, Arc::new(FakeRefresher::failing()), revoker.clone());

        let outcome = m.revoke("alice", Provider::Airtable).await.unwrap();
        assert!(outcome.removed);
        assert_eq!(revoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_register_key() {
        let m = manager(store(), Arc::new(FakeRefresher::failing()), Arc::default());

        m.register_key("alice", Provider::Airtable, "  pat123.secret  ").unwrap();
        let token = m
            .get_access_token("alice", Provider::Airtable)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.token, "pat123.secret");
        assert_eq!(token.token_type, API_KEY_TOKEN_TYPE);
        assert!(token.expires_at.is_none());

        assert!(matches!(
            m.register_key("alice", Provider::Gmail, "key"),
            Err(VaultError::UnsupportedProvider(_))
        ));
        assert!(matches!(
            m.register_key("alice", Provider::Airtable, "   "),
            Err(VaultError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_connections() {
        let store = store();
        store.upsert("alice", Provider::Gmail, &gmail_bundle(3600)).unwrap();
        let m = manager(store, Arc::new(FakeRefresher::failing()), Arc::default());

        let connections = m.connections("alice").unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].provider, Provider::Gmail);
        assert!(m.connections("bob").unwrap().is_empty());
    }
}
