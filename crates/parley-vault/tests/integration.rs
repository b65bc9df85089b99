//! Integration tests exercising the vault against a real database file.

use chrono::{Duration, Utc};

use parley_vault::crypto::generate_master_key;
use parley_vault::{StoredToken, TokenStore, TokenVault};

#[test]
fn tokens_survive_reopen_with_the_same_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.db");
    let key = generate_master_key().unwrap();

    {
        let vault = TokenVault::open(&path, key).unwrap();
        let mut token = StoredToken::bearer("persisted-token");
        token.expires_at = Some(Utc::now() + Duration::hours(2));
        vault.store_token("user@example.com", "github", token).unwrap();
    }

    let reopened = TokenVault::open(&path, key).unwrap();
    let token = reopened
        .get_valid_token("user@example.com", "github")
        .unwrap()
        .expect("token should survive reopen");
    assert_eq!(token.token_value, "persisted-token");
}

#[test]
fn wrong_key_cannot_read_stored_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.db");

    {
        let vault = TokenVault::open(&path, generate_master_key().unwrap()).unwrap();
        vault
            .store_token("user@example.com", "github", StoredToken::bearer("secret"))
            .unwrap();
    }

    let wrong_key = TokenVault::open(&path, generate_master_key().unwrap()).unwrap();
    assert!(wrong_key.get_valid_token("user@example.com", "github").is_err());
}

#[test]
fn auth_status_spans_servers() {
    let dir = tempfile::tempdir().unwrap();
    let vault = TokenVault::open(dir.path().join("vault.db"), generate_master_key().unwrap())
        .unwrap();

    vault
        .store_token("user@example.com", "github", StoredToken::bearer("a"))
        .unwrap();
    let mut expiring = StoredToken::bearer("b");
    expiring.expires_at = Some(Utc::now() - Duration::minutes(1));
    vault.store_token("user@example.com", "jira", expiring).unwrap();

    let status = vault.get_user_auth_status("user@example.com").unwrap();
    assert_eq!(status.len(), 2);
    assert!(status.iter().any(|s| s.server_name == "github" && s.valid));
    assert!(status.iter().any(|s| s.server_name == "jira" && !s.valid));
}
