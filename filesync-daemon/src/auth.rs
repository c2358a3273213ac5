//! Credentials, tokens and session keys.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use filesync_core::config::UserRecord;
use filesync_core::UserId;

pub const TOKEN_LEN: usize = 64;

/// Hex SHA-256 of `salt` followed by `password`.
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// A fresh session key for a device that did not present one.
pub fn generate_session_key() -> String {
    Uuid::new_v4().to_string()
}

/// Looks up users by credentials. Storage of the records is not this
/// crate's concern.
pub trait UserStore: Send + Sync {
    /// The user owning `login` if `password` is correct. Never says which of
    /// the two was wrong.
    fn verify(&self, login: &str, password: &str) -> Option<UserRecord>;
}

/// Users listed in the server configuration.
pub struct StaticUsers {
    salt: String,
    users: Vec<UserRecord>,
}

impl StaticUsers {
    pub fn new(salt: impl Into<String>, users: Vec<UserRecord>) -> Self {
        Self {
            salt: salt.into(),
            users,
        }
    }
}

impl UserStore for StaticUsers {
    fn verify(&self, login: &str, password: &str) -> Option<UserRecord> {
        let user = self.users.iter().find(|u| u.login == login)?;
        let hash = hash_password(&self.salt, password);
        if user.id == 0 || !hash.eq_ignore_ascii_case(&user.password_hash) {
            return None;
        }
        Some(user.clone())
    }
}

/// The token issued to one authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub token: String,
    pub session_key: String,
    pub user: UserId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn issue(user: UserId, session_key: String, validity: Duration) -> Self {
        let issued_at = Utc::now();
        let validity = chrono::Duration::from_std(validity)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        Self {
            token: generate_token(),
            session_key,
            user,
            issued_at,
            expires_at: issued_at + validity,
        }
    }

    /// Whether `presented` may start a sync at `now`.
    pub fn accepts(&self, presented: &str, now: DateTime<Utc>) -> bool {
        self.identifies(presented) && now < self.expires_at
    }

    /// Whether `presented` is this token. Expiry is not consulted: a sync
    /// that started with a valid token keeps it until the session ends.
    pub fn identifies(&self, presented: &str) -> bool {
        presented == self.token
    }
}
