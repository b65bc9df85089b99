//! Tool-layer error types.
//!
//! `AuthenticationRequired` is deliberately its own variant: it is never a
//! fatal failure of the server connection, only of the individual call, and
//! it carries everything the UI needs to start an auth flow.

use parley_kernel::KernelError;
use parley_vault::VaultError;

/// Unified error type for the tool-server layer.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// A per-user server was called without a valid stored credential.
    #[error("server `{server_name}` requires authentication")]
    AuthenticationRequired {
        server_name: String,
        auth_type: String,
        /// Present for oauth servers so the UI can redirect immediately.
        oauth_start_url: Option<String>,
        message: String,
    },

    /// An operation exceeded its bounded deadline.
    #[error("{operation} on server `{server}` timed out after {seconds}s")]
    Timeout {
        server: String,
        operation: String,
        seconds: u64,
    },

    /// The transport failed (process died, connection refused, bad frame).
    #[error("transport error for server `{server}`: {reason}")]
    Transport { server: String, reason: String },

    /// The server answered with a JSON-RPC error object.
    #[error("server `{server}` returned error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },

    /// Spawning a stdio server process failed.
    #[error("failed to spawn server `{server}`: {reason}")]
    Spawn { server: String, reason: String },

    /// The fully qualified tool name is not in the discovery index.
    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    /// No live connection exists for the server.
    #[error("no client available for server: {server}")]
    ServerNotConnected { server: String },

    /// An error propagated from the kernel crate (env expansion, config).
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// An error propagated from the credential vault.
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl McpError {
    /// Whether this error is the per-call authentication signal rather than
    /// a server failure.
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Self::AuthenticationRequired { .. })
    }
}

/// Convenience alias used throughout the tool-server layer.
pub type Result<T> = std::result::Result<T, McpError>;
