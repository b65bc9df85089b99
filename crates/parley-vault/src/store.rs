//! SQLite-backed token store.
//!
//! Credentials are keyed by `(user_email, server_name)` with the email
//! lowercased, and the token value (and refresh token, when present) is
//! encrypted with AES-256-GCM before being written.  The store is
//! process-wide state: a mutex serializes reads, writes, and revocation
//! scans, and expiry checks compare against wall-clock time.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{self, KEY_LEN, NONCE_LEN_BYTES};
use crate::error::{Result, VaultError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A per-user credential for one tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    /// The opaque token string handed to the transport.
    pub token_value: String,

    /// Credential kind (`api_key`, `bearer`, `jwt`, `oauth`).
    pub token_type: String,

    /// When the token stops being valid; `None` means no expiry.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub scopes: Option<Vec<String>>,

    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default)]
    pub metadata: Option<Value>,
}

impl StoredToken {
    /// A bearer-style token with no expiry.
    pub fn bearer(token_value: impl Into<String>) -> Self {
        Self {
            token_value: token_value.into(),
            token_type: "bearer".into(),
            expires_at: None,
            scopes: None,
            refresh_token: None,
            metadata: None,
        }
    }

    /// Whether the token is currently valid with respect to wall-clock time.
    pub fn is_valid(&self) -> bool {
        match self.expires_at {
            None => true,
            Some(expiry) => expiry > Utc::now(),
        }
    }
}

/// One row of a user's authentication overview (no secret material).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatusEntry {
    pub server_name: String,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// False when the stored token has already expired.
    pub valid: bool,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// The persistence contract the connection manager consumes.
///
/// Implementations must treat user emails case-insensitively and must never
/// return an expired token from `get_valid_token`.
pub trait TokenStore: Send + Sync {
    /// Insert or replace the credential for `(user_email, server_name)`.
    fn store_token(&self, user_email: &str, server_name: &str, token: StoredToken) -> Result<()>;

    /// Fetch the credential, returning `None` when absent or expired.
    fn get_valid_token(&self, user_email: &str, server_name: &str)
    -> Result<Option<StoredToken>>;

    /// Remove the credential.  Returns whether anything was deleted; a
    /// removed token is invisible to subsequent reads.
    fn remove_token(&self, user_email: &str, server_name: &str) -> Result<bool>;

    /// Overview of every server the user has a credential for.
    fn get_user_auth_status(&self, user_email: &str) -> Result<Vec<AuthStatusEntry>>;

    /// Remove every credential whose server name starts with `prefix`,
    /// across all users.  Returns the number of rows removed.
    fn remove_by_server_prefix(&self, prefix: &str) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tokens (
    user_email    TEXT NOT NULL,
    server_name   TEXT NOT NULL,
    token_nonce   BLOB NOT NULL,
    token_cipher  BLOB NOT NULL,
    token_type    TEXT NOT NULL,
    expires_at    TEXT,
    scopes        TEXT,
    refresh_nonce BLOB,
    refresh_cipher BLOB,
    metadata      TEXT,
    updated_at    TEXT NOT NULL,
    PRIMARY KEY (user_email, server_name)
);
";

/// SQLite-backed [`TokenStore`] with AES-256-GCM encryption at rest.
pub struct TokenVault {
    conn: Mutex<Connection>,
    key: [u8; KEY_LEN],
}

impl TokenVault {
    /// Open (or create) a vault database at `path`.
    pub fn open(path: impl AsRef<Path>, key: [u8; KEY_LEN]) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("token vault opened");
        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    /// Open an in-memory vault, used by tests and ephemeral deployments.
    pub fn open_in_memory(key: [u8; KEY_LEN]) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-write; the
        // connection itself is still usable for subsequent statements.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn seal(&self, plaintext: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let (nonce, cipher) = crypto::encrypt(plaintext.as_bytes(), &self.key)?;
        Ok((nonce.to_vec(), cipher))
    }

    fn open_sealed(&self, nonce: &[u8], cipher: &[u8]) -> Result<String> {
        let nonce: [u8; NONCE_LEN_BYTES] =
            nonce
                .try_into()
                .map_err(|_| VaultError::DecryptionFailed {
                    reason: "stored nonce has wrong length".into(),
                })?;
        let plain = crypto::decrypt(&nonce, cipher, &self.key)?;
        String::from_utf8(plain).map_err(|_| VaultError::DecryptionFailed {
            reason: "decrypted token is not valid UTF-8".into(),
        })
    }
}

impl TokenStore for TokenVault {
    fn store_token(&self, user_email: &str, server_name: &str, token: StoredToken) -> Result<()> {
        let (token_nonce, token_cipher) = self.seal(&token.token_value)?;
        let (refresh_nonce, refresh_cipher) = match &token.refresh_token {
            Some(rt) => {
                let (n, c) = self.seal(rt)?;
                (Some(n), Some(c))
            }
            None => (None, None),
        };
        let scopes_json = token
            .scopes
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata_json = token
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO tokens
             (user_email, server_name, token_nonce, token_cipher, token_type,
              expires_at, scopes, refresh_nonce, refresh_cipher, metadata, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                user_email.to_lowercase(),
                server_name,
                token_nonce,
                token_cipher,
                token.token_type,
                token.expires_at.map(|t| t.to_rfc3339()),
                scopes_json,
                refresh_nonce,
                refresh_cipher,
                metadata_json,
                Utc::now().to_rfc3339(),
            ],
        )?;

        tracing::debug!(server = %server_name, "token stored");
        Ok(())
    }

    fn get_valid_token(
        &self,
        user_email: &str,
        server_name: &str,
    ) -> Result<Option<StoredToken>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT token_nonce, token_cipher, token_type, expires_at, scopes,
                        refresh_nonce, refresh_cipher, metadata
                 FROM tokens WHERE user_email = ?1 AND server_name = ?2",
                params![user_email.to_lowercase(), server_name],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<Vec<u8>>>(5)?,
                        row.get::<_, Option<Vec<u8>>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);

        let Some((
            token_nonce,
            token_cipher,
            token_type,
            expires_at,
            scopes,
            refresh_nonce,
            refresh_cipher,
            metadata,
        )) = row
        else {
            return Ok(None);
        };

        let expires_at = expires_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| VaultError::Internal(format!("bad expires_at in store: {e}")))
            })
            .transpose()?;

        let token_value = self.open_sealed(&token_nonce, &token_cipher)?;
        let refresh_token = match (refresh_nonce, refresh_cipher) {
            (Some(n), Some(c)) => Some(self.open_sealed(&n, &c)?),
            _ => None,
        };
        let scopes = scopes.map(|s| serde_json::from_str(&s)).transpose()?;
        let metadata = metadata.map(|s| serde_json::from_str(&s)).transpose()?;

        let token = StoredToken {
            token_value,
            token_type,
            expires_at,
            scopes,
            refresh_token,
            metadata,
        };

        // Expired tokens stay in the table for auth-status reporting but are
        // invisible to callers asking for a usable credential.
        if !token.is_valid() {
            tracing::debug!(server = %server_name, "stored token is expired");
            return Ok(None);
        }

        Ok(Some(token))
    }

    fn remove_token(&self, user_email: &str, server_name: &str) -> Result<bool> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM tokens WHERE user_email = ?1 AND server_name = ?2",
            params![user_email.to_lowercase(), server_name],
        )?;
        if removed > 0 {
            tracing::info!(server = %server_name, "token removed");
        }
        Ok(removed > 0)
    }

    fn get_user_auth_status(&self, user_email: &str) -> Result<Vec<AuthStatusEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT server_name, token_type, expires_at
             FROM tokens WHERE user_email = ?1 ORDER BY server_name",
        )?;
        let rows = stmt.query_map(params![user_email.to_lowercase()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (server_name, token_type, expires_at) = row?;
            let expires_at = expires_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc));
            let valid = expires_at.is_none_or(|t| t > Utc::now());
            entries.push(AuthStatusEntry {
                server_name,
                token_type,
                expires_at,
                valid,
            });
        }
        Ok(entries)
    }

    fn remove_by_server_prefix(&self, prefix: &str) -> Result<usize> {
        let conn = self.lock();
        // LIKE with a trailing % scans by prefix; escape wildcards in the
        // prefix itself so server names containing % or _ match literally.
        let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let removed = conn.execute(
            "DELETE FROM tokens WHERE server_name LIKE ?1 ESCAPE '\\'",
            params![format!("{escaped}%")],
        )?;
        tracing::info!(prefix = %prefix, removed, "tokens removed by server prefix");
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
