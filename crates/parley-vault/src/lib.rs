//! Encrypted per-user credential store.
//!
//! Tool servers with `auth_type` other than `none` are called with a
//! per-user credential.  This crate owns those credentials:
//!
//! - [`store::TokenStore`] -- the contract the connection manager consumes
//!   (`store_token`, `get_valid_token`, `remove_token`, auth status, bulk
//!   removal by server prefix).
//! - [`store::TokenVault`] -- the SQLite-backed implementation.  Token
//!   values are encrypted with AES-256-GCM before they touch disk.
//! - [`crypto`] -- the AEAD primitives.
//!
//! Expiry checks compare against wall-clock time: `get_valid_token` returns
//! a token only when `expires_at` is absent or in the future.

pub mod crypto;
pub mod error;
pub mod store;

pub use error::{Result, VaultError};
pub use store::{AuthStatusEntry, StoredToken, TokenStore, TokenVault};
