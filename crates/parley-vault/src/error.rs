//! Vault error types.

/// Unified error type for the vault crate.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The supplied master key has the wrong length for AES-256-GCM.
    #[error("invalid master key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// AES-256-GCM sealing failed.
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// AES-256-GCM opening failed (wrong key or corrupted data).
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// JSON serialization of scopes/metadata failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal vault error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
