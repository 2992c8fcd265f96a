//! In-process store implementations.
//!
//! Suitable for tests, single-node embedding and as a reference for the
//! semantics the PostgreSQL stores must match.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::audit::{AuditEvent, AuditEventType};
use super::store::{
    AuditSink, CredentialStore, LockoutStore, RefreshTokenStore, StoreError, TwoFactorProvider,
};
use crate::config::RefreshTokenMode;
use crate::models::auth::{LockoutState, RefreshTokenRecord, UserRecord};

/// Users keyed by username.
#[derive(Default)]
pub struct MemoryCredentialStore {
    users: RwLock<HashMap<String, UserRecord>>,
    offline: AtomicBool,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: UserRecord) {
        self.users.write().await.insert(user.username.clone(), user);
    }

    /// Simulate an unreachable backend.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("credential store offline".into()));
        }
        Ok(self.users.read().await.get(username).cloned())
    }
}

/// Refresh-token records keyed by (user, hash).
#[derive(Default)]
pub struct MemoryRefreshTokenStore {
    records: Mutex<HashMap<(String, String), RefreshTokenRecord>>,
}

impl MemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count_for_user(&self, user_id: &str) -> usize {
        self.records
            .lock()
            .await
            .keys()
            .filter(|(uid, _)| uid == user_id)
            .count()
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    async fn store(
        &self,
        record: &RefreshTokenRecord,
        mode: RefreshTokenMode,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if mode == RefreshTokenMode::SingleSession {
            records.retain(|(uid, _), _| uid != &record.user_id);
        }
        records.insert(
            (record.user_id.clone(), record.token_hash.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn rotate(
        &self,
        old_hash: &str,
        replacement: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        let key = (replacement.user_id.clone(), old_hash.to_string());
        match records.get(&key) {
            Some(existing) if existing.expires_at > now => {
                records.remove(&key);
                records.insert(
                    (replacement.user_id.clone(), replacement.token_hash.clone()),
                    replacement.clone(),
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke(&self, user_id: &str, token_hash: &str) -> Result<u64, StoreError> {
        let removed = self
            .records
            .lock()
            .await
            .remove(&(user_id.to_string(), token_hash.to_string()));
        Ok(u64::from(removed.is_some()))
    }

    async fn revoke_all(&self, user_id: &str) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|(uid, _), _| uid != user_id);
        Ok((before - records.len()) as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        Ok((before - records.len()) as u64)
    }
}

/// Lockout counters keyed by username.
#[derive(Default)]
pub struct MemoryLockoutStore {
    states: Mutex<HashMap<String, LockoutState>>,
}

impl MemoryLockoutStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockoutStore for MemoryLockoutStore {
    async fn load(&self, key: &str) -> Result<Option<LockoutState>, StoreError> {
        Ok(self.states.lock().await.get(key).cloned())
    }

    async fn register_failure(
        &self,
        key: &str,
        threshold: u32,
        locked_until: DateTime<Utc>,
    ) -> Result<LockoutState, StoreError> {
        let mut states = self.states.lock().await;
        let state = states.entry(key.to_string()).or_default();
        state.failed_attempts = state.failed_attempts.saturating_add(1);
        if state.failed_attempts >= threshold {
            state.locked_until = Some(locked_until);
        }
        Ok(state.clone())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.states.lock().await.remove(key);
        Ok(())
    }
}

/// Audit events kept in memory.
#[derive(Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
    offline: AtomicBool,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn event_types(&self) -> Vec<AuditEventType> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.event_type)
            .collect()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, event: &AuditEvent) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit log offline".into()));
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Two-factor disabled for every user.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTwoFactor;

#[async_trait]
impl TwoFactorProvider for NoTwoFactor {
    async fn is_enabled(&self, _user_id: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn verify(&self, _user_id: &str, _code: &str) -> Result<bool, StoreError> {
        Ok(false)
    }
}

/// Fixed codes per user id.
#[derive(Default)]
pub struct StaticTwoFactor {
    codes: RwLock<HashMap<String, String>>,
}

impl StaticTwoFactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enroll(&self, user_id: &str, code: &str) {
        self.codes
            .write()
            .await
            .insert(user_id.to_string(), code.to_string());
    }
}

#[async_trait]
impl TwoFactorProvider for StaticTwoFactor {
    async fn is_enabled(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.codes.read().await.contains_key(user_id))
    }

    async fn verify(&self, user_id: &str, code: &str) -> Result<bool, StoreError> {
        Ok(self
            .codes
            .read()
            .await
            .get(user_id)
            .is_some_and(|expected| expected == code))
    }
}
