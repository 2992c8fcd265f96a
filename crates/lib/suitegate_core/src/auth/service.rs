//! Authentication service: password login, two-factor completion, refresh
//! rotation and revocation.
//!
//! Every terminal outcome is written to the audit sink. Store failures are
//! returned as [`AuthError::Unavailable`] so callers back off instead of
//! treating them as bad credentials.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::AuthError;
use super::audit::{AuditEvent, AuditEventType};
use super::jwt::{TokenCodec, TokenRejection};
use super::lockout::LockoutPolicy;
use super::memory::{MemoryAuditLog, MemoryLockoutStore, MemoryRefreshTokenStore, NoTwoFactor};
use super::password;
use super::rate_limit::RateLimiter;
use super::secrets::SecretsProvider;
use super::store::{
    AuditSink, CredentialStore, LockoutStore, RefreshTokenStore, StoreError, TwoFactorProvider,
    hash_refresh_token,
};
use crate::clock::{Clock, SystemClock};
use crate::config::AuthConfig;
use crate::models::auth::{
    AuthMethod, RefreshTokenRecord, RequestContext, SessionClaims, TokenPair, TokenType, UserInfo,
    UserRecord, UserStatus,
};
use crate::random::{OsRandom, RandomSource};

/// Length of pending two-factor markers.
const PENDING_MARKER_LEN: usize = 48;

/// Why an attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidCredentials,
    AccountLocked,
    AccountInactive,
    RateLimited,
    InvalidTwoFactor,
    TokenExpired,
    TokenInvalid,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidCredentials => "invalid_credentials",
            RejectReason::AccountLocked => "account_locked",
            RejectReason::AccountInactive => "account_inactive",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::InvalidTwoFactor => "invalid_two_factor",
            RejectReason::TokenExpired => "token_expired",
            RejectReason::TokenInvalid => "token_invalid",
        }
    }

    /// Message safe to show the caller. Never discloses whether the username
    /// exists or when a lock ends.
    pub fn user_message(&self) -> &'static str {
        match self {
            RejectReason::InvalidCredentials => "Invalid username or password",
            RejectReason::AccountLocked => "Account temporarily locked, please try again later",
            RejectReason::AccountInactive => "Account is not active",
            RejectReason::RateLimited => "Too many attempts, please try again later",
            RejectReason::InvalidTwoFactor => "Invalid verification code",
            RejectReason::TokenExpired | RejectReason::TokenInvalid => {
                "Session expired, please sign in again"
            }
        }
    }
}

/// Tokens and identity returned on success.
#[derive(Debug, Clone)]
pub struct AuthSuccess {
    pub user_id: String,
    pub user: UserInfo,
    pub tokens: TokenPair,
}

/// Terminal result of an authentication step.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Authenticated(Box<AuthSuccess>),
    /// Password accepted; complete with [`AuthenticationCore::verify_two_factor`].
    TwoFactorRequired {
        pending_token: String,
        expires_at: DateTime<Utc>,
    },
    PasswordExpired {
        user_id: String,
    },
    PasswordChangeRequired {
        user_id: String,
    },
    Rejected(RejectReason),
}

impl AuthOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthOutcome::Authenticated(_))
    }

    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            AuthOutcome::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn success(&self) -> Option<&AuthSuccess> {
        match self {
            AuthOutcome::Authenticated(success) => Some(success),
            _ => None,
        }
    }
}

/// Counts removed by [`AuthenticationCore::purge_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub refresh_tokens: u64,
    pub pending_two_factor: usize,
    pub rate_limit_windows: usize,
}

#[derive(Debug, Clone)]
struct PendingTwoFactor {
    user: UserRecord,
    expires_at: DateTime<Utc>,
}

fn unavailable(e: StoreError) -> AuthError {
    error!("auth store failure: {e}");
    AuthError::from(e)
}

/// Orchestrates credential checks, lockout, token issuance and rotation.
pub struct AuthenticationCore {
    config: AuthConfig,
    codec: TokenCodec,
    lockout: LockoutPolicy,
    rate_limiter: RateLimiter,
    credentials: Arc<dyn CredentialStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    two_factor: Arc<dyn TwoFactorProvider>,
    audit_sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    pending: DashMap<String, PendingTwoFactor>,
}

impl AuthenticationCore {
    pub fn builder(
        config: AuthConfig,
        secrets: Arc<dyn SecretsProvider>,
        credentials: Arc<dyn CredentialStore>,
    ) -> AuthenticationCoreBuilder {
        AuthenticationCoreBuilder {
            config,
            secrets,
            credentials,
            refresh_tokens: None,
            lockout_store: None,
            two_factor: None,
            audit_sink: None,
            clock: None,
            random: None,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn lockout(&self) -> &LockoutPolicy {
        &self.lockout
    }

    /// Authenticate with username + password.
    pub async fn authenticate_with_password(
        &self,
        username: &str,
        password: &str,
        ctx: &RequestContext,
    ) -> Result<AuthOutcome, AuthError> {
        let now = self.clock.now();

        if !self.within_rate_limit(username, ctx) {
            warn!(username, "login rate limited");
            self.audit(
                AuditEvent::new(AuditEventType::RateLimited, AuthMethod::Password, ctx, now)
                    .username(username),
            )
            .await?;
            return Ok(AuthOutcome::Rejected(RejectReason::RateLimited));
        }

        if self.lockout.is_locked(username).await.map_err(unavailable)? {
            self.audit(
                AuditEvent::new(AuditEventType::LoginBlocked, AuthMethod::Password, ctx, now)
                    .username(username)
                    .details(json!({ "reason": RejectReason::AccountLocked.as_str() })),
            )
            .await?;
            return Ok(AuthOutcome::Rejected(RejectReason::AccountLocked));
        }

        let user = self
            .credentials
            .find_by_username(username)
            .await
            .map_err(unavailable)?;

        // Unknown users and users without a password take the same path as a
        // wrong password, including the bcrypt work.
        let verified = match user.as_ref().and_then(|u| u.password_hash.as_deref()) {
            Some(hash) => password::verify_password(password, hash).unwrap_or_else(|e| {
                warn!(username, "stored password hash unusable: {e}");
                false
            }),
            None => {
                password::verify_against_dummy(password);
                false
            }
        };

        let user = match user {
            Some(user) if verified => user,
            other => {
                return self
                    .reject_credentials(
                        username,
                        other.map(|u| u.id),
                        AuthMethod::Password,
                        RejectReason::InvalidCredentials,
                        ctx,
                    )
                    .await;
            }
        };

        if user.status != UserStatus::Active {
            self.audit(
                AuditEvent::new(AuditEventType::LoginFailure, AuthMethod::Password, ctx, now)
                    .user_id(&user.id)
                    .username(username)
                    .details(json!({
                        "reason": RejectReason::AccountInactive.as_str(),
                        "status": user.status.as_str(),
                    })),
            )
            .await?;
            return Ok(AuthOutcome::Rejected(RejectReason::AccountInactive));
        }

        if user.password_expires_at.is_some_and(|at| at <= now) {
            self.audit(
                AuditEvent::new(AuditEventType::PasswordExpired, AuthMethod::Password, ctx, now)
                    .user_id(&user.id)
                    .username(username),
            )
            .await?;
            return Ok(AuthOutcome::PasswordExpired { user_id: user.id });
        }

        if user.must_change_password {
            self.audit(
                AuditEvent::new(
                    AuditEventType::PasswordChangeRequired,
                    AuthMethod::Password,
                    ctx,
                    now,
                )
                .user_id(&user.id)
                .username(username),
            )
            .await?;
            return Ok(AuthOutcome::PasswordChangeRequired { user_id: user.id });
        }

        if self
            .two_factor
            .is_enabled(&user.id)
            .await
            .map_err(unavailable)?
        {
            let pending_token = self.random.alphanumeric(PENDING_MARKER_LEN);
            let expires_at = now + Duration::seconds(self.config.two_factor_ttl_secs);
            self.audit(
                AuditEvent::new(
                    AuditEventType::TwoFactorChallenge,
                    AuthMethod::Password,
                    ctx,
                    now,
                )
                .user_id(&user.id)
                .username(username),
            )
            .await?;
            self.pending.insert(
                pending_token.clone(),
                PendingTwoFactor { user, expires_at },
            );
            return Ok(AuthOutcome::TwoFactorRequired {
                pending_token,
                expires_at,
            });
        }

        self.complete_login(&user, AuthMethod::Password, ctx).await
    }

    /// Finish a login that stopped at [`AuthOutcome::TwoFactorRequired`].
    pub async fn verify_two_factor(
        &self,
        pending_token: &str,
        code: &str,
        ctx: &RequestContext,
    ) -> Result<AuthOutcome, AuthError> {
        let now = self.clock.now();
        let pending = self
            .pending
            .get(pending_token)
            .map(|entry| entry.value().clone())
            .filter(|p| p.expires_at > now);

        let Some(pending) = pending else {
            self.pending.remove(pending_token);
            self.audit(
                AuditEvent::new(AuditEventType::TwoFactorFailure, AuthMethod::TwoFactor, ctx, now)
                    .details(json!({ "reason": "unknown_or_expired_challenge" })),
            )
            .await?;
            return Ok(AuthOutcome::Rejected(RejectReason::InvalidTwoFactor));
        };
        let user = pending.user;

        if !self.within_rate_limit(&user.username, ctx) {
            self.audit(
                AuditEvent::new(AuditEventType::RateLimited, AuthMethod::TwoFactor, ctx, now)
                    .user_id(&user.id)
                    .username(&user.username),
            )
            .await?;
            return Ok(AuthOutcome::Rejected(RejectReason::RateLimited));
        }

        if self
            .lockout
            .is_locked(&user.username)
            .await
            .map_err(unavailable)?
        {
            self.pending.remove(pending_token);
            self.audit(
                AuditEvent::new(AuditEventType::LoginBlocked, AuthMethod::TwoFactor, ctx, now)
                    .user_id(&user.id)
                    .username(&user.username)
                    .details(json!({ "reason": RejectReason::AccountLocked.as_str() })),
            )
            .await?;
            return Ok(AuthOutcome::Rejected(RejectReason::AccountLocked));
        }

        let valid = self
            .two_factor
            .verify(&user.id, code)
            .await
            .map_err(unavailable)?;
        if !valid {
            let outcome = self
                .reject_credentials(
                    &user.username,
                    Some(user.id.clone()),
                    AuthMethod::TwoFactor,
                    RejectReason::InvalidTwoFactor,
                    ctx,
                )
                .await?;
            if self.lockout.is_locked(&user.username).await.map_err(unavailable)? {
                self.pending.remove(pending_token);
            }
            return Ok(outcome);
        }

        // A concurrent verification may already have consumed the marker.
        if self.pending.remove(pending_token).is_none() {
            return Ok(AuthOutcome::Rejected(RejectReason::InvalidTwoFactor));
        }
        self.complete_login(&user, AuthMethod::TwoFactor, ctx).await
    }

    /// Exchange a refresh token for a new pair. The presented token stops
    /// working once this succeeds.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        ctx: &RequestContext,
    ) -> Result<AuthOutcome, AuthError> {
        let now = self.clock.now();
        let claims = match self.codec.verify_typed(refresh_token, TokenType::Refresh) {
            Ok(claims) => claims,
            Err(TokenRejection::SecretUnavailable) => {
                return Err(AuthError::Unavailable("signing secret unavailable".into()));
            }
            Err(rejection) => {
                debug!(%rejection, "refresh token rejected");
                let reason = match rejection {
                    TokenRejection::Expired => RejectReason::TokenExpired,
                    _ => RejectReason::TokenInvalid,
                };
                self.audit(
                    AuditEvent::new(
                        AuditEventType::TokenRefreshRejected,
                        AuthMethod::RefreshToken,
                        ctx,
                        now,
                    )
                    .details(json!({ "reason": rejection.to_string() })),
                )
                .await?;
                return Ok(AuthOutcome::Rejected(reason));
            }
        };

        let (tokens, new_refresh) = self.codec.issue_pair(&claims.sub, &claims.user)?;
        let replacement = RefreshTokenRecord {
            user_id: claims.sub.clone(),
            token_hash: hash_refresh_token(&new_refresh.token),
            expires_at: new_refresh.expires_at(),
            created_at: now,
        };
        let rotated = self
            .refresh_tokens
            .rotate(&hash_refresh_token(refresh_token), &replacement, now)
            .await
            .map_err(unavailable)?;

        if !rotated {
            warn!(user_id = %claims.sub, "refresh token is not live (rotated or revoked)");
            self.audit(
                AuditEvent::new(
                    AuditEventType::TokenRefreshRejected,
                    AuthMethod::RefreshToken,
                    ctx,
                    now,
                )
                .user_id(&claims.sub)
                .username(&claims.user.username)
                .details(json!({ "reason": "not_live" })),
            )
            .await?;
            return Ok(AuthOutcome::Rejected(RejectReason::TokenInvalid));
        }

        self.audit(
            AuditEvent::new(
                AuditEventType::TokenRefreshed,
                AuthMethod::RefreshToken,
                ctx,
                now,
            )
            .user_id(&claims.sub)
            .username(&claims.user.username)
            .session_id(&tokens.session_id),
        )
        .await?;

        Ok(AuthOutcome::Authenticated(Box::new(AuthSuccess {
            user_id: claims.sub,
            user: claims.user,
            tokens,
        })))
    }

    /// Revoke one refresh token, or every token of the user when `None`.
    /// Returns the number of records removed.
    pub async fn revoke(
        &self,
        user_id: &str,
        refresh_token: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<u64, AuthError> {
        let now = self.clock.now();
        let (scope, revoked) = match refresh_token {
            Some(token) => (
                "single",
                self.refresh_tokens
                    .revoke(user_id, &hash_refresh_token(token))
                    .await
                    .map_err(unavailable)?,
            ),
            None => (
                "all",
                self.refresh_tokens
                    .revoke_all(user_id)
                    .await
                    .map_err(unavailable)?,
            ),
        };
        self.audit(
            AuditEvent::new(AuditEventType::TokenRevoked, AuthMethod::RefreshToken, ctx, now)
                .user_id(user_id)
                .details(json!({ "scope": scope, "revoked": revoked })),
        )
        .await?;
        info!(user_id, scope, revoked, "refresh tokens revoked");
        Ok(revoked)
    }

    /// Verify an access token presented with an API call.
    pub fn validate_access_token(&self, token: &str) -> Result<SessionClaims, TokenRejection> {
        self.codec.verify_typed(token, TokenType::Access)
    }

    /// Drop expired refresh records, stale two-factor challenges and elapsed
    /// rate-limit windows.
    pub async fn purge_expired(&self) -> Result<PurgeReport, AuthError> {
        let now = self.clock.now();
        let refresh_tokens = self
            .refresh_tokens
            .purge_expired(now)
            .await
            .map_err(unavailable)?;
        let mut pending_two_factor = 0;
        self.pending.retain(|_, p| {
            let live = p.expires_at > now;
            if !live {
                pending_two_factor += 1;
            }
            live
        });
        let report = PurgeReport {
            refresh_tokens,
            pending_two_factor,
            rate_limit_windows: self.rate_limiter.purge(),
        };
        debug!(?report, "purged expired auth state");
        Ok(report)
    }

    async fn complete_login(
        &self,
        user: &UserRecord,
        method: AuthMethod,
        ctx: &RequestContext,
    ) -> Result<AuthOutcome, AuthError> {
        let now = self.clock.now();
        self.lockout
            .record_success(&user.username)
            .await
            .map_err(unavailable)?;

        let info = user.user_info(method);
        let (tokens, refresh) = self.codec.issue_pair(&user.id, &info)?;
        let record = RefreshTokenRecord {
            user_id: user.id.clone(),
            token_hash: hash_refresh_token(&refresh.token),
            expires_at: refresh.expires_at(),
            created_at: now,
        };
        self.refresh_tokens
            .store(&record, self.config.refresh_token_mode)
            .await
            .map_err(unavailable)?;

        self.audit(
            AuditEvent::new(AuditEventType::LoginSuccess, method, ctx, now)
                .user_id(&user.id)
                .username(&user.username)
                .session_id(&tokens.session_id),
        )
        .await?;
        info!(user_id = %user.id, method = method.as_str(), "user authenticated");

        Ok(AuthOutcome::Authenticated(Box::new(AuthSuccess {
            user_id: user.id.clone(),
            user: info,
            tokens,
        })))
    }

    async fn reject_credentials(
        &self,
        username: &str,
        user_id: Option<String>,
        method: AuthMethod,
        reason: RejectReason,
        ctx: &RequestContext,
    ) -> Result<AuthOutcome, AuthError> {
        let now = self.clock.now();
        let failure = self
            .lockout
            .record_failure(username)
            .await
            .map_err(unavailable)?;

        let event_type = match method {
            AuthMethod::TwoFactor => AuditEventType::TwoFactorFailure,
            _ => AuditEventType::LoginFailure,
        };
        let mut event = AuditEvent::new(event_type, method, ctx, now)
            .username(username)
            .details(json!({
                "reason": reason.as_str(),
                "failed_attempts": failure.failed_attempts,
            }));
        if let Some(id) = &user_id {
            event = event.user_id(id);
        }
        self.audit(event).await?;

        if failure.newly_locked {
            let mut event = AuditEvent::new(AuditEventType::AccountLocked, method, ctx, now)
                .username(username)
                .details(json!({
                    "failed_attempts": failure.failed_attempts,
                    "locked_until": failure.locked_until,
                }));
            if let Some(id) = user_id {
                event = event.user_id(id);
            }
            self.audit(event).await?;
        }
        Ok(AuthOutcome::Rejected(reason))
    }

    fn within_rate_limit(&self, username: &str, ctx: &RequestContext) -> bool {
        let user_key = format!("user:{username}");
        match ctx.ip_address {
            Some(ip) => {
                let ip_key = format!("ip:{ip}");
                self.rate_limiter
                    .check_all([user_key.as_str(), ip_key.as_str()])
            }
            None => self.rate_limiter.check(&user_key),
        }
    }

    async fn audit(&self, event: AuditEvent) -> Result<(), AuthError> {
        self.audit_sink.record(&event).await.map_err(|e| {
            error!(
                event_type = event.event_type.as_str(),
                "audit write failed: {e}"
            );
            AuthError::Unavailable(format!("audit log: {e}"))
        })
    }
}

/// Wires an [`AuthenticationCore`]; unset collaborators default to the
/// in-memory stores, no two-factor, the system clock and the OS RNG.
pub struct AuthenticationCoreBuilder {
    config: AuthConfig,
    secrets: Arc<dyn SecretsProvider>,
    credentials: Arc<dyn CredentialStore>,
    refresh_tokens: Option<Arc<dyn RefreshTokenStore>>,
    lockout_store: Option<Arc<dyn LockoutStore>>,
    two_factor: Option<Arc<dyn TwoFactorProvider>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    clock: Option<Arc<dyn Clock>>,
    random: Option<Arc<dyn RandomSource>>,
}

impl AuthenticationCoreBuilder {
    pub fn refresh_tokens(mut self, store: Arc<dyn RefreshTokenStore>) -> Self {
        self.refresh_tokens = Some(store);
        self
    }

    pub fn lockout_store(mut self, store: Arc<dyn LockoutStore>) -> Self {
        self.lockout_store = Some(store);
        self
    }

    pub fn two_factor(mut self, provider: Arc<dyn TwoFactorProvider>) -> Self {
        self.two_factor = Some(provider);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    pub fn build(self) -> Result<AuthenticationCore, AuthError> {
        self.config.validate()?;
        // Fail early on a bad secret rather than on the first login.
        self.secrets.current()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let codec = TokenCodec::from_config(&self.config, self.secrets, Arc::clone(&clock));
        let lockout = LockoutPolicy::from_config(
            &self.config,
            self.lockout_store
                .unwrap_or_else(|| Arc::new(MemoryLockoutStore::new())),
            Arc::clone(&clock),
        );
        let rate_limiter = RateLimiter::from_config(&self.config, Arc::clone(&clock))?;

        Ok(AuthenticationCore {
            codec,
            lockout,
            rate_limiter,
            credentials: self.credentials,
            refresh_tokens: self
                .refresh_tokens
                .unwrap_or_else(|| Arc::new(MemoryRefreshTokenStore::new())),
            two_factor: self.two_factor.unwrap_or_else(|| Arc::new(NoTwoFactor)),
            audit_sink: self
                .audit_sink
                .unwrap_or_else(|| Arc::new(MemoryAuditLog::new())),
            clock,
            random: self.random.unwrap_or_else(|| Arc::new(OsRandom)),
            pending: DashMap::new(),
            config: self.config,
        })
    }
}
