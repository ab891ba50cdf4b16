//! Encrypted credential storage using SQLite.
//!
//! Stores integration credentials per (user, provider). All token columns hold
//! AES-256-GCM envelopes.

use super::{Codec, ConnectionSummary, Credential, TokenBundle};
use crate::error::Result;
use crate::providers::Provider;
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     encrypted_access_token TEXT NOT NULL,
///     encrypted_refresh_token TEXT,       -- optional
///     encrypted_secondary_token TEXT,     -- optional, per-user token of dual-token providers
///     token_type TEXT NOT NULL,
///     scope TEXT NOT NULL,
///     expires_at TEXT,                    -- RFC 3339 (optional)
///     created_at TEXT NOT NULL,           -- RFC 3339
///     updated_at TEXT NOT NULL,           -- RFC 3339
///     UNIQUE(user_id, provider)
/// );
/// ```
///
/// # Concurrency
/// - One row per (user_id, provider) is guaranteed by the UNIQUE constraint and
///   `ON CONFLICT DO UPDATE`, so concurrent writers for the same key converge on
///   a single row and the later write wins
/// - Connection is wrapped in a Mutex for safe concurrent access
pub struct CredentialStore {
    conn: Mutex<Connection>,
    codec: Codec,
}

/// Row as read from SQLite, before decryption
struct EncryptedRow {
    access_token: String,
    refresh_token: Option<String>,
    secondary_token: Option<String>,
    token_type: String,
    scope: String,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// `db_path` may be `:memory:` for tests.
    pub fn new<P: AsRef<Path>>(db_path: P, codec: Codec) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                encrypted_access_token TEXT NOT NULL,
                encrypted_refresh_token TEXT,
                encrypted_secondary_token TEXT,
                token_type TEXT NOT NULL,
                scope TEXT NOT NULL,
                expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, provider)
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_user ON credentials(user_id);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            codec,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a token bundle for a user and provider, replacing any existing row.
    pub fn upsert(&self, user_id: &str, provider: Provider, bundle: &TokenBundle) -> Result<()> {
        self.upsert_at(user_id, provider, bundle, Utc::now())?;
        Ok(())
    }

    /// Same as [`CredentialStore::upsert`], with `expires_at` computed relative to `now`.
    ///
    /// Returns the stored expiry. A lifetime that cannot be turned into a
    /// timestamp is rejected before anything is written.
    pub fn upsert_at(
        &self,
        user_id: &str,
        provider: Provider,
        bundle: &TokenBundle,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let expires_at = bundle.expires_at(now)?;

        let access_token = self.codec.encrypt(&bundle.access_token)?;
        let refresh_token = bundle
            .refresh_token
            .as_deref()
            .map(|t| self.codec.encrypt(t))
            .transpose()?;
        let secondary_token = bundle
            .secondary_token
            .as_deref()
            .map(|t| self.codec.encrypt(t))
            .transpose()?;

        let stored_expiry = expires_at.map(|at| at.to_rfc3339());
        let now = now.to_rfc3339();

        self.conn().execute(
            r#"
            INSERT INTO credentials (
                user_id, provider,
                encrypted_access_token, encrypted_refresh_token, encrypted_secondary_token,
                token_type, scope, expires_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                encrypted_access_token = excluded.encrypted_access_token,
                encrypted_refresh_token = excluded.encrypted_refresh_token,
                encrypted_secondary_token = excluded.encrypted_secondary_token,
                token_type = excluded.token_type,
                scope = excluded.scope,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![
                user_id,
                provider.as_str(),
                access_token,
                refresh_token,
                secondary_token,
                bundle.token_type,
                bundle.scope,
                stored_expiry,
                now,
            ],
        )?;

        debug!(
            user_id = %user_id,
            provider = %provider,
            has_refresh_token = bundle.refresh_token.is_some(),
            has_secondary_token = bundle.secondary_token.is_some(),
            "Credential stored"
        );

        Ok(expires_at)
    }

    /// Retrieves and decrypts the credential for a user and provider.
    ///
    /// Returns `Ok(None)` when nothing is stored and `Err(Decryption)` when the
    /// row exists but cannot be opened with the current key.
    pub fn get(&self, user_id: &str, provider: Provider) -> Result<Option<Credential>> {
        let row = self
            .conn()
            .query_row(
                r#"
                SELECT encrypted_access_token, encrypted_refresh_token, encrypted_secondary_token,
                       token_type, scope, expires_at, created_at, updated_at
                FROM credentials
                WHERE user_id = ?1 AND provider = ?2
                "#,
                params![user_id, provider.as_str()],
                |row| {
                    Ok(EncryptedRow {
                        access_token: row.get(0)?,
                        refresh_token: row.get(1)?,
                        secondary_token: row.get(2)?,
                        token_type: row.get(3)?,
                        scope: row.get(4)?,
                        expires_at: row
                            .get::<_, Option<String>>(5)?
                            .map(|s| parse_timestamp(5, &s))
                            .transpose()?,
                        created_at: parse_timestamp(6, &row.get::<_, String>(6)?)?,
                        updated_at: parse_timestamp(7, &row.get::<_, String>(7)?)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decrypt = |envelope: &str, column: &str| {
            self.codec.decrypt(envelope).map_err(|e| {
                warn!(user_id = %user_id, provider = %provider, column = column, "Stored credential cannot be decrypted");
                e
            })
        };

        let access_token = decrypt(&row.access_token, "access_token")?;
        let refresh_token = row
            .refresh_token
            .as_deref()
            .map(|e| decrypt(e, "refresh_token"))
            .transpose()?;
        let secondary_token = row
            .secondary_token
            .as_deref()
            .map(|e| decrypt(e, "secondary_token"))
            .transpose()?;

        Ok(Some(Credential {
            user_id: user_id.to_string(),
            provider,
            access_token,
            refresh_token,
            secondary_token,
            token_type: row.token_type,
            scope: row.scope,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    /// Deletes the credential for a user and provider.
    ///
    /// Returns `Ok(false)` when no row existed.
    pub fn delete(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let rows_affected = self.conn().execute(
            "DELETE FROM credentials WHERE user_id = ?1 AND provider = ?2",
            params![user_id, provider.as_str()],
        )?;

        Ok(rows_affected > 0)
    }

    /// Lists the providers a user has credentials for, without decrypting anything.
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<ConnectionSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT provider, token_type, scope, expires_at, updated_at
            FROM credentials
            WHERE user_id = ?1
            ORDER BY provider
            "#,
        )?;

        let rows = stmt
            .query_map(params![user_id], |row| {
                let provider: String = row.get(0)?;
                let expires_at = row
                    .get::<_, Option<String>>(3)?
                    .map(|s| parse_timestamp(3, &s))
                    .transpose()?;
                Ok((
                    provider,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    expires_at,
                    parse_timestamp(4, &row.get::<_, String>(4)?)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let summaries = rows
            .into_iter()
            .filter_map(|(name, token_type, scope, expires_at, updated_at)| {
                match name.parse::<Provider>() {
                    Ok(provider) => Some(ConnectionSummary {
                        provider,
                        token_type,
                        scope,
                        expires_at,
                        updated_at,
                    }),
                    Err(_) => {
                        warn!(provider = %name, "Skipping credential for unknown provider");
                        None
                    }
                }
            })
            .collect();

        Ok(summaries)
    }
}

fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use chrono::Duration;
    use std::sync::Arc;

    fn test_codec() -> Codec {
        Codec::from_key_bytes(&[0u8; 32]).unwrap()
    }

    fn create_test_store() -> CredentialStore {
        CredentialStore::new(":memory:", test_codec()).expect("Failed to create test store")
    }

    fn create_test_bundle() -> TokenBundle {
        TokenBundle {
            access_token: "access-token-12345".to_string(),
            refresh_token: Some("refresh-token-67890".to_string()),
            secondary_token: None,
            token_type: "Bearer".to_string(),
            scope: "https://www.googleapis.com/auth/gmail.readonly".to_string(),
            expires_in: Some(3600),
        }
    }

    fn row_count(store: &CredentialStore, user_id: &str, provider: Provider) -> i64 {
        store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM credentials WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str()],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_upsert_and_get() {
        let store = create_test_store();
        let bundle = create_test_bundle();
        let now = Utc::now();

        store
            .upsert_at("user1", Provider::Gmail, &bundle, now)
            .expect("Failed to store");

        let retrieved = store
            .get("user1", Provider::Gmail)
            .expect("Failed to get")
            .expect("Credential not found");

        assert_eq!(retrieved.access_token, bundle.access_token);
        assert_eq!(retrieved.refresh_token, bundle.refresh_token);
        assert_eq!(retrieved.scope, bundle.scope);
        assert_eq!(retrieved.token_type, "Bearer");
        assert_eq!(
            retrieved.expires_at.unwrap().timestamp(),
            (now + Duration::seconds(3600)).timestamp()
        );
    }

    #[test]
    fn test_tokens_are_encrypted_at_rest() {
        let store = create_test_store();
        store
            .upsert("user1", Provider::Gmail, &create_test_bundle())
            .unwrap();

        let (access, refresh): (String, String) = store
            .conn()
            .query_row(
                "SELECT encrypted_access_token, encrypted_refresh_token FROM credentials",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();

        assert!(!access.contains("access-token-12345"));
        assert!(!refresh.contains("refresh-token-67890"));
        assert_eq!(access.split('.').count(), 3);
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();

        let result = store.get("user1", Provider::Gmail).expect("Failed to get");
        assert!(result.is_none());
    }

    #[test]
    fn test_upsert_twice_keeps_one_row_with_later_values() {
        let store = create_test_store();
        store
            .upsert("user1", Provider::Gmail, &create_test_bundle())
            .unwrap();
        let first = store.get("user1", Provider::Gmail).unwrap().unwrap();

        let second_bundle = TokenBundle {
            access_token: "new-access-token".to_string(),
            refresh_token: Some("new-refresh-token".to_string()),
            secondary_token: None,
            token_type: "Bearer".to_string(),
            scope: "calendar".to_string(),
            expires_in: Some(7200),
        };
        store
            .upsert("user1", Provider::Gmail, &second_bundle)
            .unwrap();

        assert_eq!(row_count(&store, "user1", Provider::Gmail), 1);

        let retrieved = store.get("user1", Provider::Gmail).unwrap().unwrap();
        assert_eq!(retrieved.access_token, "new-access-token");
        assert_eq!(retrieved.refresh_token.as_deref(), Some("new-refresh-token"));
        assert_eq!(retrieved.scope, "calendar");
        // created_at survives the upsert
        assert_eq!(retrieved.created_at, first.created_at);
        assert!(retrieved.updated_at >= first.updated_at);
    }

    #[test]
    fn test_concurrent_upserts_never_duplicate() {
        let store = Arc::new(create_test_store());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let bundle = TokenBundle::bearer(&format!("token-{}", i), None, Some(3600));
                    store.upsert("user1", Provider::Slack, &bundle).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(row_count(&store, "user1", Provider::Slack), 1);
        let stored = store.get("user1", Provider::Slack).unwrap().unwrap();
        assert!(stored.access_token.starts_with("token-"));
    }

    #[test]
    fn test_secondary_token_on_same_row() {
        let store = create_test_store();
        let bundle = TokenBundle {
            access_token: "xoxb-bot".to_string(),
            refresh_token: None,
            secondary_token: Some("xoxp-user".to_string()),
            token_type: "bot".to_string(),
            scope: "chat:write".to_string(),
            expires_in: None,
        };

        store.upsert("user1", Provider::Slack, &bundle).unwrap();

        assert_eq!(row_count(&store, "user1", Provider::Slack), 1);
        let stored = store.get("user1", Provider::Slack).unwrap().unwrap();
        assert_eq!(stored.access_token, "xoxb-bot");
        assert_eq!(stored.secondary_token.as_deref(), Some("xoxp-user"));
        assert!(stored.expires_at.is_none());
    }

    #[test]
    fn test_delete() {
        let store = create_test_store();
        store
            .upsert("user1", Provider::Gmail, &create_test_bundle())
            .unwrap();

        assert!(store.delete("user1", Provider::Gmail).unwrap());
        assert!(store.get("user1", Provider::Gmail).unwrap().is_none());

        // Deleting again should return false
        assert!(!store.delete("user1", Provider::Gmail).unwrap());
    }

    #[test]
    fn test_list_by_user() {
        let store = create_test_store();
        let bundle = create_test_bundle();

        store.upsert("user1", Provider::Gmail, &bundle).unwrap();
        store.upsert("user1", Provider::Airtable, &bundle).unwrap();
        store.upsert("user1", Provider::Slack, &bundle).unwrap();
        store.upsert("user2", Provider::Gmail, &bundle).unwrap();

        let providers: Vec<Provider> = store
            .list_by_user("user1")
            .unwrap()
            .into_iter()
            .map(|s| s.provider)
            .collect();
        assert_eq!(providers.len(), 3);
        assert!(providers.contains(&Provider::Gmail));
        assert!(providers.contains(&Provider::Airtable));
        assert!(providers.contains(&Provider::Slack));

        assert_eq!(store.list_by_user("user2").unwrap().len(), 1);
        assert!(store.list_by_user("user3").unwrap().is_empty());
    }

    #[test]
    fn test_out_of_range_lifetime_is_rejected_without_writing() {
        let store = create_test_store();
        store
            .upsert("user1", Provider::Gmail, &create_test_bundle())
            .unwrap();

        for seconds in [i64::MAX, 0, -1] {
            let bundle = TokenBundle::bearer("replacement", None, Some(seconds));
            assert!(matches!(
                store.upsert("user1", Provider::Gmail, &bundle),
                Err(VaultError::InvalidInput(_))
            ));
        }

        let kept = store.get("user1", Provider::Gmail).unwrap().unwrap();
        assert_eq!(kept.access_token, "access-token-12345");
        assert!(kept.expires_at.is_some());
    }

    #[test]
    fn test_upsert_at_returns_stored_expiry() {
        let store = create_test_store();
        let now = Utc::now();

        let expires_at = store
            .upsert_at("user1", Provider::Gmail, &create_test_bundle(), now)
            .unwrap();

        let stored = store.get("user1", Provider::Gmail).unwrap().unwrap();
        assert_eq!(expires_at, Some(now + Duration::seconds(3600)));
        assert_eq!(
            stored.expires_at.map(|at| at.timestamp()),
            expires_at.map(|at| at.timestamp())
        );
    }

    #[test]
    fn test_credentials_without_refresh_token() {
        let store = create_test_store();
        let bundle = TokenBundle::bearer("access-only", None, None);

        store.upsert("user1", Provider::Gmail, &bundle).unwrap();

        let retrieved = store.get("user1", Provider::Gmail).unwrap().unwrap();
        assert_eq!(retrieved.access_token, "access-only");
        assert!(retrieved.refresh_token.is_none());
        assert!(retrieved.expires_at.is_none());
    }

    #[test]
    fn test_reopen_with_other_key_is_decryption_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");

        {
            let store = CredentialStore::new(&path, test_codec()).unwrap();
            store
                .upsert("user1", Provider::Gmail, &create_test_bundle())
                .unwrap();
        }

        // Same key: durable across reopen
        let store = CredentialStore::new(&path, test_codec()).unwrap();
        assert!(store.get("user1", Provider::Gmail).unwrap().is_some());
        drop(store);

        // Rotated key: row exists but is unreadable
        let other = Codec::from_key_bytes(&[9u8; 32]).unwrap();
        let store = CredentialStore::new(&path, other).unwrap();
        assert!(matches!(
            store.get("user1", Provider::Gmail),
            Err(VaultError::Decryption(_))
        ));
    }
}
