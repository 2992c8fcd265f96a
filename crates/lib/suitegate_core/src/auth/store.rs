//! Storage seams consumed by the authentication core.
//!
//! Implementations: [`super::memory`] (in-process) and [`super::queries`]
//! (PostgreSQL).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::audit::AuditEvent;
use crate::config::RefreshTokenMode;
use crate::models::auth::{LockoutState, RefreshTokenRecord, UserRecord};

/// Storage failures. All of them are infrastructure problems, never a
/// verdict on the caller's credentials.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// SHA-256 hash a refresh token for storage.
pub fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// User lookup.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;
}

/// Second-factor verification.
#[async_trait]
pub trait TwoFactorProvider: Send + Sync {
    async fn is_enabled(&self, user_id: &str) -> Result<bool, StoreError>;

    async fn verify(&self, user_id: &str, code: &str) -> Result<bool, StoreError>;
}

/// Server-side refresh-token hashes. A refresh token is only usable while
/// its hash is live here.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Persist a new record. In [`RefreshTokenMode::SingleSession`] any other
    /// record of the same user is replaced.
    async fn store(
        &self,
        record: &RefreshTokenRecord,
        mode: RefreshTokenMode,
    ) -> Result<(), StoreError>;

    /// Atomically swap `old_hash` for `replacement`. Returns `false` when the
    /// old hash is missing or expired at `now`; nothing changes in that case.
    async fn rotate(
        &self,
        old_hash: &str,
        replacement: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete one record. Returns the number removed.
    async fn revoke(&self, user_id: &str, token_hash: &str) -> Result<u64, StoreError>;

    /// Delete every record of a user.
    async fn revoke_all(&self, user_id: &str) -> Result<u64, StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Persisted lockout counters keyed by username.
#[async_trait]
pub trait LockoutStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<LockoutState>, StoreError>;

    /// Atomically increment the failure counter; when the new count reaches
    /// `threshold`, set `locked_until`. Returns the updated state.
    async fn register_failure(
        &self,
        key: &str,
        threshold: u32,
        locked_until: DateTime<Utc>,
    ) -> Result<LockoutState, StoreError>;

    /// Reset the counter and clear any lock.
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_hash_is_hex_sha256() {
        let hash = hash_refresh_token("abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
