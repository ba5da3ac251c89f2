//! Local session store.
//!
//! Persists the authenticated session and the transient verification
//! artifacts that bridge registration and account activation. Backed by a
//! small sqlite key-value table so state survives process restarts. The
//! key names mirror the mobile app's AsyncStorage keys, so a data dir
//! written by either client stays readable by the other.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

/// Storage keys, shared with the mobile client.
pub mod keys {
    pub const TOKEN: &str = "token";
    pub const USER: &str = "user";
    pub const VERIFICATION_CODE: &str = "verificationCode";
    pub const PENDING_EMAIL: &str = "pendingVerificationEmail";
    pub const PENDING_PASSWORD: &str = "pendingRegistrationPassword";
}

/// Raw backend JWTs start with the base64 of `{"` headers.
const JWT_PREFIX: &str = "eyJ";

/// The authenticated identity held by the client.
///
/// A session is atomic: there is never a token without a user or vice
/// versa, which is why this is a struct inside an `Option` rather than a
/// pair of independent optionals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user: UserSummary,
}

/// User record replaced wholesale on each successful auth transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: i64,
    pub email: String,
    pub token: String,
    pub role: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firstname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cin: Option<i64>,
}

/// Transient artifacts between registration and account activation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingVerification {
    pub code: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

impl PendingVerification {
    /// Verification can only proceed with both a code and an email on
    /// hand. A missing password merely degrades auto-login.
    pub fn ready(&self) -> Option<(&str, &str)> {
        match (self.code.as_deref(), self.email.as_deref()) {
            (Some(code), Some(email)) => Some((code, email)),
            _ => None,
        }
    }
}

/// Partial update for the pending-verification keys. `None` fields are
/// left untouched.
#[derive(Debug, Clone, Default)]
pub struct PendingUpdate {
    pub code: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

/// Tagged on-disk token representation, written once at persist time so
/// readers never have to guess the format.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum StoredToken {
    Raw { value: String },
    Wrapped { value: serde_json::Value },
}

impl StoredToken {
    fn bearer(&self) -> Option<String> {
        match self {
            StoredToken::Raw { value } => Some(value.clone()),
            StoredToken::Wrapped { value } => value
                .get("token")
                .and_then(|t| t.as_str())
                .map(str::to_string),
        }
    }
}

/// Decode a stored token value into the bearer string.
///
/// Accepts the tagged representation first, then falls back to legacy
/// formats still found in older data dirs: a bare JWT (recognized by its
/// fixed 3-character prefix), or a JSON object wrapping a `token` field.
/// Never errors; an unparseable value is used as a raw string.
fn decode_token(stored: &str) -> Option<String> {
    if let Ok(tagged) = serde_json::from_str::<StoredToken>(stored) {
        return tagged.bearer();
    }
    if stored.starts_with(JWT_PREFIX) {
        return Some(stored.to_string());
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(stored) {
        if let Some(token) = value.get("token").and_then(|t| t.as_str()) {
            return Some(token.to_string());
        }
    }
    Some(stored.to_string())
}

/// sqlite-backed key-value store. Cheap to clone (pool handle).
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (creating if needed) the store under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir: {}", data_dir.display()))?;

        let db_path = data_dir.join("mazad.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        info!("Opening session store at {}", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .context("Failed to open session database")?;

        // WAL keeps the store readable while a write is in flight
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;

        run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read key '{key}'"))?;
        Ok(row.map(|(value,)| value))
    }

    /// Current session, or `None` when no complete session is stored.
    ///
    /// A half-written pair (token without user or the reverse) is treated
    /// as no session, preserving the atomicity invariant on the read side.
    pub async fn session(&self) -> Result<Option<Session>> {
        let token = match self.token().await? {
            Some(token) => token,
            None => return Ok(None),
        };
        let user_json = match self.get(keys::USER).await? {
            Some(json) => json,
            None => return Ok(None),
        };
        match serde_json::from_str::<UserSummary>(&user_json) {
            Ok(user) => Ok(Some(Session { token, user })),
            Err(e) => {
                warn!(error = %e, "Stored user record is corrupt, treating as no session");
                Ok(None)
            }
        }
    }

    /// Bearer token for outgoing requests, if a session is stored.
    pub async fn token(&self) -> Result<Option<String>> {
        Ok(self.get(keys::TOKEN).await?.and_then(|v| decode_token(&v)))
    }

    /// Persist a session atomically: token and user written in one
    /// transaction, so a crash cannot leave one without the other.
    pub async fn set_session(&self, session: &Session) -> Result<()> {
        let token = serde_json::to_string(&StoredToken::Raw {
            value: session.token.clone(),
        })?;
        let user = serde_json::to_string(&session.user)?;

        let mut tx = self.pool.begin().await?;
        upsert(&mut tx, keys::TOKEN, &token).await?;
        upsert(&mut tx, keys::USER, &user).await?;
        tx.commit().await.context("Failed to persist session")?;
        Ok(())
    }

    pub async fn clear_session(&self) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key IN (?, ?)")
            .bind(keys::TOKEN)
            .bind(keys::USER)
            .execute(&self.pool)
            .await
            .context("Failed to clear session")?;
        Ok(())
    }

    pub async fn pending(&self) -> Result<PendingVerification> {
        Ok(PendingVerification {
            code: self.get(keys::VERIFICATION_CODE).await?,
            email: self.get(keys::PENDING_EMAIL).await?,
            password: self.get(keys::PENDING_PASSWORD).await?,
        })
    }

    /// Merge-write pending verification fields; `None` fields are kept.
    pub async fn set_pending(&self, update: PendingUpdate) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if let Some(code) = &update.code {
            upsert(&mut tx, keys::VERIFICATION_CODE, code).await?;
        }
        if let Some(email) = &update.email {
            upsert(&mut tx, keys::PENDING_EMAIL, email).await?;
        }
        if let Some(password) = &update.password {
            upsert(&mut tx, keys::PENDING_PASSWORD, password).await?;
        }
        tx.commit().await.context("Failed to store pending verification")?;
        Ok(())
    }

    /// Remove all three pending keys in one transaction. Consumed state
    /// must never resurrect, so this is all-or-nothing.
    pub async fn clear_pending(&self) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key IN (?, ?, ?)")
            .bind(keys::VERIFICATION_CODE)
            .bind(keys::PENDING_EMAIL)
            .bind(keys::PENDING_PASSWORD)
            .execute(&self.pool)
            .await
            .context("Failed to clear pending verification")?;
        Ok(())
    }

    /// Shut the pool down so every later query fails, simulating a
    /// broken storage backend.
    #[cfg(test)]
    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }
}

async fn upsert(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &str,
    value: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now')) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("Failed to write key '{key}'"))?;
    Ok(())
}

/// Execute a SQL migration file, skipping comment lines
async fn execute_sql(pool: &SqlitePool, sql: &str) -> Result<()> {
    for statement in sql.split(';') {
        let cleaned: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = cleaned.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }
    Ok(())
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    execute_sql(pool, include_str!("../../migrations/001_initial.sql")).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_session() -> Session {
        Session {
            token: "eyJhbGciOiJIUzI1NiJ9.payload.sig".to_string(),
            user: UserSummary {
                id: 1,
                email: "a@b.com".to_string(),
                token: "eyJhbGciOiJIUzI1NiJ9.payload.sig".to_string(),
                role: "USER".to_string(),
                status: "ACTIVE".to_string(),
                firstname: Some("Amina".to_string()),
                lastname: None,
                cin: Some(12345678),
            },
        }
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();

        assert!(store.session().await.unwrap().is_none());

        let session = sample_session();
        store.set_session(&session).await.unwrap();

        let read_back = store.session().await.unwrap().unwrap();
        assert_eq!(read_back, session);
        assert_eq!(store.token().await.unwrap().unwrap(), session.token);
    }

    #[tokio::test]
    async fn test_clear_session_removes_both_keys() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();

        store.set_session(&sample_session()).await.unwrap();
        store.clear_session().await.unwrap();

        assert!(store.session().await.unwrap().is_none());
        assert!(store.token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_merges_partial_updates() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();

        store
            .set_pending(PendingUpdate {
                code: Some("123456".to_string()),
                email: Some("a@b.com".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .set_pending(PendingUpdate {
                password: Some("hunter2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.ready(), Some(("123456", "a@b.com")));
        assert_eq!(pending.password.as_deref(), Some("hunter2"));
    }

    #[tokio::test]
    async fn test_clear_pending_removes_all_three() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();

        store
            .set_pending(PendingUpdate {
                code: Some("123456".to_string()),
                email: Some("a@b.com".to_string()),
                password: Some("hunter2".to_string()),
            })
            .await
            .unwrap();
        store.clear_pending().await.unwrap();

        let pending = store.pending().await.unwrap();
        assert!(pending.ready().is_none());
        assert!(pending.password.is_none());
    }

    #[tokio::test]
    async fn test_pending_without_code_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();

        store
            .set_pending(PendingUpdate {
                email: Some("a@b.com".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(store.pending().await.unwrap().ready().is_none());
    }

    #[test]
    fn test_decode_tagged_raw_token() {
        let stored = r#"{"kind":"raw","value":"eyJabc.def.ghi"}"#;
        assert_eq!(decode_token(stored).unwrap(), "eyJabc.def.ghi");
    }

    #[test]
    fn test_decode_tagged_wrapped_token() {
        let stored = r#"{"kind":"wrapped","value":{"token":"eyJabc.def.ghi","id":4}}"#;
        assert_eq!(decode_token(stored).unwrap(), "eyJabc.def.ghi");
    }

    #[test]
    fn test_decode_legacy_bare_jwt() {
        assert_eq!(decode_token("eyJabc.def.ghi").unwrap(), "eyJabc.def.ghi");
    }

    #[test]
    fn test_decode_legacy_wrapped_object() {
        let stored = r#"{"token":"eyJabc.def.ghi","id":4}"#;
        assert_eq!(decode_token(stored).unwrap(), "eyJabc.def.ghi");
    }

    #[test]
    fn test_decode_unparseable_value_falls_back_to_raw() {
        // Opaque non-JWT token from an older deployment: used as-is
        assert_eq!(decode_token("some-opaque-token").unwrap(), "some-opaque-token");
    }

    #[test]
    fn test_persisted_token_is_tagged() {
        // The writer always produces the tagged form
        let dir = TempDir::new().unwrap();
        tokio_test::block_on(async {
            let store = SessionStore::open(dir.path()).await.unwrap();
            store.set_session(&sample_session()).await.unwrap();
            let raw = store.get(keys::TOKEN).await.unwrap().unwrap();
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(value["kind"], "raw");
        });
    }
}
