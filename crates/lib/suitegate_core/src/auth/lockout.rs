//! Failed-login lockout.
//!
//! Unlocked → (failure) count+1 → (count ≥ threshold) Locked(until) →
//! (time passes) Unlocked with the count kept → (success) count reset.
//! Because the count survives expiry, the first failure after a lock
//! expires relocks immediately.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::store::{LockoutStore, StoreError};
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::models::auth::LockoutState;

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    /// This failure is the one that locked the account.
    pub newly_locked: bool,
}

/// Tracks failed attempts per username and locks after a threshold.
pub struct LockoutPolicy {
    store: Arc<dyn LockoutStore>,
    clock: Arc<dyn Clock>,
    threshold: u32,
    duration: Duration,
}

impl LockoutPolicy {
    pub fn new(
        store: Arc<dyn LockoutStore>,
        clock: Arc<dyn Clock>,
        threshold: u32,
        duration: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            threshold: threshold.max(1),
            duration,
        }
    }

    pub fn from_config(
        config: &AuthConfig,
        store: Arc<dyn LockoutStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            store,
            clock,
            config.lockout_threshold,
            Duration::seconds(config.lockout_duration_secs),
        )
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub async fn record_failure(&self, user: &str) -> Result<FailureOutcome, StoreError> {
        let now = self.clock.now();
        let lock_until = now + self.duration;
        let state = self
            .store
            .register_failure(user, self.threshold, lock_until)
            .await?;

        let newly_locked = state.locked_until == Some(lock_until);
        if newly_locked {
            warn!(
                user,
                failed_attempts = state.failed_attempts,
                locked_until = %lock_until,
                "account locked after repeated failures"
            );
        }
        Ok(FailureOutcome {
            failed_attempts: state.failed_attempts,
            locked_until: state.locked_until,
            newly_locked,
        })
    }

    pub async fn is_locked(&self, user: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .store
            .load(user)
            .await?
            .is_some_and(|state| state.is_locked_at(now)))
    }

    pub async fn record_success(&self, user: &str) -> Result<(), StoreError> {
        self.store.clear(user).await
    }

    pub async fn state(&self, user: &str) -> Result<LockoutState, StoreError> {
        Ok(self.store.load(user).await?.unwrap_or_default())
    }

    /// Administrative unlock.
    pub async fn unlock(&self, user: &str) -> Result<(), StoreError> {
        self.store.clear(user).await?;
        info!(user, "account unlocked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::MemoryLockoutStore;
    use crate::clock::ManualClock;

    fn policy() -> (LockoutPolicy, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_timestamp(1_700_000_000));
        let policy = LockoutPolicy::new(
            Arc::new(MemoryLockoutStore::new()),
            clock.clone(),
            5,
            Duration::minutes(30),
        );
        (policy, clock)
    }

    #[tokio::test]
    async fn locks_after_threshold_failures() {
        let (policy, _) = policy();
        for i in 1..5 {
            let outcome = policy.record_failure("alice").await.unwrap();
            assert_eq!(outcome.failed_attempts, i);
            assert!(!outcome.newly_locked);
            assert!(!policy.is_locked("alice").await.unwrap());
        }
        let outcome = policy.record_failure("alice").await.unwrap();
        assert!(outcome.newly_locked);
        assert!(policy.is_locked("alice").await.unwrap());
    }

    #[tokio::test]
    async fn lock_expires_without_resetting_count() {
        let (policy, clock) = policy();
        for _ in 0..5 {
            policy.record_failure("alice").await.unwrap();
        }
        clock.advance(Duration::minutes(30) + Duration::seconds(1));
        assert!(!policy.is_locked("alice").await.unwrap());
        assert_eq!(policy.state("alice").await.unwrap().failed_attempts, 5);

        // The next failure relocks straight away.
        let outcome = policy.record_failure("alice").await.unwrap();
        assert!(outcome.newly_locked);
        assert!(policy.is_locked("alice").await.unwrap());
    }

    #[tokio::test]
    async fn success_resets_count_and_lock() {
        let (policy, _) = policy();
        for _ in 0..7 {
            policy.record_failure("alice").await.unwrap();
        }
        policy.record_success("alice").await.unwrap();
        assert!(!policy.is_locked("alice").await.unwrap());
        assert_eq!(policy.state("alice").await.unwrap(), LockoutState::default());
    }

    #[tokio::test]
    async fn users_are_tracked_independently() {
        let (policy, _) = policy();
        for _ in 0..5 {
            policy.record_failure("alice").await.unwrap();
        }
        assert!(policy.is_locked("alice").await.unwrap());
        assert!(!policy.is_locked("bob").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_failures_are_not_lost() {
        let (policy, _) = policy();
        let policy = Arc::new(policy);
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let policy = Arc::clone(&policy);
            tasks.push(tokio::spawn(async move {
                policy.record_failure("carol").await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(policy.state("carol").await.unwrap().failed_attempts, 4);
    }
}
