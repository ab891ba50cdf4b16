//! Handshake session storage.
//!
//! A session links the initiate request to the provider callback. It is keyed by
//! (user_id, provider): a second initiate replaces the first, and the callback
//! takes (removes) the session whether or not it goes on to match.

use crate::config::{SessionBackend, StorageConfig};
use crate::error::Result;
use crate::providers::Provider;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// In-flight authorization attempt
#[derive(Clone)]
pub struct HandshakeSession {
    pub user_id: String,
    pub provider: Provider,
    pub state: String,
    /// Present only for PKCE providers
    pub code_verifier: Option<String>,
    /// Page the user is sent back to after a successful callback
    pub referrer: String,
    pub expires_at: DateTime<Utc>,
}

impl HandshakeSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Debug for HandshakeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeSession")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("has_code_verifier", &self.code_verifier.is_some())
            .field("referrer", &self.referrer)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Keyed, TTL-bounded storage for handshake sessions.
pub trait SessionStore: Send + Sync {
    /// Stores `session`, replacing any session for the same (user, provider).
    /// Expired sessions are purged as a side effect.
    fn save(&self, session: &HandshakeSession, now: DateTime<Utc>) -> Result<()>;

    /// Removes and returns the session for (user, provider).
    ///
    /// An expired session is removed too but reported as absent.
    fn take(
        &self,
        user_id: &str,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<Option<HandshakeSession>>;
}

/// Opens the session backend selected in configuration.
pub fn open_session_store(config: &StorageConfig) -> Result<Arc<dyn SessionStore>> {
    match config.session_backend {
        SessionBackend::Sqlite => {
            info!(path = %config.sessions_db(), "Using SQLite handshake sessions");
            Ok(Arc::new(SqliteSessionStore::new(config.sessions_db())?))
        }
        SessionBackend::Memory => {
            info!("Using in-memory handshake sessions (single process only)");
            Ok(Arc::new(MemorySessionStore::new()))
        }
    }
}

/// Durable sessions; every instance sharing the database can serve the callback.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS handshake_sessions (
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                state TEXT NOT NULL,
                code_verifier TEXT,
                referrer TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, provider)
            );
            CREATE INDEX IF NOT EXISTS idx_handshake_sessions_expiry
                ON handshake_sessions(expires_at);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of stored sessions, expired ones included
    pub fn len(&self) -> Result<usize> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM handshake_sessions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl SessionStore for SqliteSessionStore {
    fn save(&self, session: &HandshakeSession, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();

        let purged = conn.execute(
            "DELETE FROM handshake_sessions WHERE expires_at <= ?1",
            params![now.timestamp()],
        )?;
        if purged > 0 {
            debug!(purged = purged, "Purged expired handshake sessions");
        }

        conn.execute(
            r#"
            INSERT INTO handshake_sessions (user_id, provider, state, code_verifier, referrer, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                state = excluded.state,
                code_verifier = excluded.code_verifier,
                referrer = excluded.referrer,
                expires_at = excluded.expires_at
            "#,
            params![
                session.user_id,
                session.provider.as_str(),
                session.state,
                session.code_verifier,
                session.referrer,
                session.expires_at.timestamp(),
            ],
        )?;

        Ok(())
    }

    fn take(
        &self,
        user_id: &str,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<Option<HandshakeSession>> {
        // DELETE ... RETURNING makes the read and the removal one statement,
        // so two callbacks racing for the same session cannot both get it
        let row = self
            .conn()
            .query_row(
                r#"
                DELETE FROM handshake_sessions
                WHERE user_id = ?1 AND provider = ?2
                RETURNING state, code_verifier, referrer, expires_at
                "#,
                params![user_id, provider.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let session = row.and_then(|(state, code_verifier, referrer, expires_at)| {
            Some(HandshakeSession {
                user_id: user_id.to_string(),
                provider,
                state,
                code_verifier,
                referrer,
                expires_at: Utc.timestamp_opt(expires_at, 0).single()?,
            })
        });

        Ok(session.filter(|s| !s.is_expired_at(now)))
    }
}

/// Process-local sessions for single-instance development setups.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<(String, Provider), HandshakeSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &HandshakeSession, now: DateTime<Utc>) -> Result<()> {
        self.sessions.retain(|_, s| !s.is_expired_at(now));
        self.sessions.insert(
            (session.user_id.clone(), session.provider),
            session.clone(),
        );
        Ok(())
    }

    fn take(
        &self,
        user_id: &str,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<Option<HandshakeSession>> {
        let session = self
            .sessions
            .remove(&(user_id.to_string(), provider))
            .map(|(_, s)| s);
        Ok(session.filter(|s| !s.is_expired_at(now)))
    }
}
