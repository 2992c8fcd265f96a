//! PostgreSQL-backed auth stores.
//!
//! All statements are parameterized. Lockout increments and refresh-token
//! rotation are single conditional statements so concurrent callers cannot
//! lose updates or resurrect a revoked token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::audit::AuditEvent;
use super::store::{AuditSink, CredentialStore, LockoutStore, RefreshTokenStore, StoreError};
use crate::config::RefreshTokenMode;
use crate::models::auth::{LockoutState, RefreshTokenRecord, UserRecord, UserStatus};

/// Auth tables on one PostgreSQL pool.
#[derive(Clone)]
pub struct PgAuthStore {
    pool: PgPool,
}

impl PgAuthStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded migrations in `suitegate_core/migrations/`.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Create a user, returning its ID.
    pub async fn create_user(
        &self,
        username: &str,
        email: Option<&str>,
        display_name: Option<&str>,
        password_hash: &str,
    ) -> Result<String, StoreError> {
        let user_id = sqlx::query_scalar::<_, String>(
            "INSERT INTO auth_users (username, email, display_name, password_hash) \
             VALUES ($1, $2, $3, $4) RETURNING id::text",
        )
        .bind(username)
        .bind(email)
        .bind(display_name)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(user_id)
    }
}

type UserRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<DateTime<Utc>>,
    bool,
);

#[async_trait]
impl CredentialStore for PgAuthStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id::text, username, email, display_name, password_hash, status, \
                    password_expires_at, must_change_password \
             FROM auth_users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(
                id,
                username,
                email,
                display_name,
                password_hash,
                status,
                password_expires_at,
                must_change_password,
            )| UserRecord {
                id,
                username,
                email,
                display_name,
                password_hash,
                status: UserStatus::parse(&status),
                password_expires_at,
                must_change_password,
            },
        ))
    }
}

#[async_trait]
impl RefreshTokenStore for PgAuthStore {
    async fn store(
        &self,
        record: &RefreshTokenRecord,
        mode: RefreshTokenMode,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if mode == RefreshTokenMode::SingleSession {
            // Concurrent logins for one user queue here until commit.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(&record.user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
                .bind(&record.user_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO refresh_tokens (user_id, token_hash, expires_at, created_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id, token_hash) \
             DO UPDATE SET expires_at = EXCLUDED.expires_at, created_at = EXCLUDED.created_at",
        )
        .bind(&record.user_id)
        .bind(&record.token_hash)
        .bind(record.expires_at)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn rotate(
        &self,
        old_hash: &str,
        replacement: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens \
             SET token_hash = $3, expires_at = $4, created_at = $5 \
             WHERE user_id = $1 AND token_hash = $2 AND expires_at > $6",
        )
        .bind(&replacement.user_id)
        .bind(old_hash)
        .bind(&replacement.token_hash)
        .bind(replacement.expires_at)
        .bind(replacement.created_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke(&self, user_id: &str, token_hash: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1 AND token_hash = $2")
            .bind(user_id)
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_all(&self, user_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LockoutStore for PgAuthStore {
    async fn load(&self, key: &str) -> Result<Option<LockoutState>, StoreError> {
        let row = sqlx::query_as::<_, (i32, Option<DateTime<Utc>>)>(
            "SELECT failed_attempts, locked_until FROM lockout_state WHERE user_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(failed_attempts, locked_until)| LockoutState {
            failed_attempts: failed_attempts.max(0) as u32,
            locked_until,
        }))
    }

    async fn register_failure(
        &self,
        key: &str,
        threshold: u32,
        locked_until: DateTime<Utc>,
    ) -> Result<LockoutState, StoreError> {
        let threshold = i32::try_from(threshold).unwrap_or(i32::MAX);
        let (failed_attempts, locked_until) = sqlx::query_as::<_, (i32, Option<DateTime<Utc>>)>(
            "INSERT INTO lockout_state (user_key, failed_attempts, locked_until) \
             VALUES ($1, 1, CASE WHEN 1 >= $2::int THEN $3::timestamptz ELSE NULL END) \
             ON CONFLICT (user_key) DO UPDATE SET \
                 failed_attempts = lockout_state.failed_attempts + 1, \
                 locked_until = CASE \
                     WHEN lockout_state.failed_attempts + 1 >= $2::int THEN $3::timestamptz \
                     ELSE lockout_state.locked_until END \
             RETURNING failed_attempts, locked_until",
        )
        .bind(key)
        .bind(threshold)
        .bind(locked_until)
        .fetch_one(&self.pool)
        .await?;
        Ok(LockoutState {
            failed_attempts: failed_attempts.max(0) as u32,
            locked_until,
        })
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM lockout_state WHERE user_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for PgAuthStore {
    async fn record(&self, event: &AuditEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auth_audit_log \
             (id, user_id, username, event_type, auth_method, ip_address, user_agent, \
              session_id, details_json, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(event.id)
        .bind(event.user_id.as_deref())
        .bind(event.username.as_deref())
        .bind(event.event_type.as_str())
        .bind(event.auth_method.as_str())
        .bind(event.ip_address.map(|ip| ip.to_string()))
        .bind(event.user_agent.as_deref())
        .bind(event.session_id.as_deref())
        .bind(&event.details)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
