//! Coarse per-identifier attempt limiting.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::Clock as GovernorClock;
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter as KeyedLimiter};

use crate::clock::Clock;
use crate::config::{AuthConfig, ConfigError};

/// Adapts the injected [`Clock`] so limiter state follows the same time
/// source as lockout and token expiry.
#[derive(Clone)]
struct LimiterClock(Arc<dyn Clock>);

impl GovernorClock for LimiterClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        let since_epoch = self
            .0
            .now()
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0);
        Nanos::from(Duration::from_nanos(since_epoch))
    }
}

type Limiter =
    KeyedLimiter<String, DashMapStateStore<String>, LimiterClock, NoOpMiddleware<Nanos>>;

/// GCRA limiter keyed by identifier (username, client IP). Each key may
/// spend `max_attempts` at once; the budget refills evenly over `window`.
pub struct RateLimiter {
    limiter: Limiter,
}

impl RateLimiter {
    pub fn new(
        clock: Arc<dyn Clock>,
        max_attempts: u32,
        window: Duration,
    ) -> Result<Self, ConfigError> {
        let burst = NonZeroU32::new(max_attempts)
            .ok_or_else(|| ConfigError::Invalid("rate_limit_attempts must be >= 1".into()))?;
        let quota = Quota::with_period(window / burst.get())
            .ok_or_else(|| ConfigError::Invalid("rate limit window too short".into()))?
            .allow_burst(burst);
        Ok(Self {
            limiter: KeyedLimiter::new(quota, DashMapStateStore::default(), LimiterClock(clock)),
        })
    }

    pub fn from_config(config: &AuthConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let window_secs = u64::try_from(config.rate_limit_window_secs).map_err(|_| {
            ConfigError::Invalid("rate_limit_window_secs must be positive".into())
        })?;
        Self::new(
            clock,
            config.rate_limit_attempts,
            Duration::from_secs(window_secs),
        )
    }

    /// Count one attempt for `key`. Returns `false` once its budget is spent.
    pub fn check(&self, key: &str) -> bool {
        self.limiter.check_key(&key.to_string()).is_ok()
    }

    /// Count one attempt against every key; all keys are charged even if an
    /// earlier one is already over budget.
    pub fn check_all<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> bool {
        keys.into_iter()
            .map(|key| self.check(key))
            .fold(true, |allowed, ok| allowed && ok)
    }

    /// Forget keys whose budget has fully refilled. Returns how many were
    /// dropped; concurrent inserts can make this an undercount.
    pub fn purge(&self) -> usize {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        before.saturating_sub(self.limiter.len())
    }

    pub fn tracked(&self) -> usize {
        self.limiter.len()
    }
}
