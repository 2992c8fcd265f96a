//! Login, lockout and refresh-rotation flows against the in-memory stores.

use std::sync::{Arc, Once};

use chrono::Duration;
use suitegate_core::auth::audit::AuditEventType;
use suitegate_core::auth::jwt::TokenRejection;
use suitegate_core::auth::memory::{MemoryAuditLog, MemoryCredentialStore, MemoryRefreshTokenStore};
use suitegate_core::auth::password::hash_password_with_cost;
use suitegate_core::auth::secrets::{SecretsProvider, StaticSecret};
use suitegate_core::auth::{AuthOutcome, AuthenticationCore, RejectReason};
use suitegate_core::clock::ManualClock;
use suitegate_core::config::{AuthConfig, RefreshTokenMode};
use suitegate_core::models::auth::{RequestContext, UserRecord, UserStatus};

const PASSWORD: &str = "correct horse battery staple";

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".parse().unwrap()),
            )
            .with_test_writer()
            .try_init();
    });
}

struct Harness {
    core: AuthenticationCore,
    audit: Arc<MemoryAuditLog>,
    refresh: Arc<MemoryRefreshTokenStore>,
    secrets: Arc<StaticSecret>,
    clock: Arc<ManualClock>,
}

async fn harness(config: AuthConfig) -> Harness {
    init_tracing();
    let users = Arc::new(MemoryCredentialStore::new());
    users
        .insert(UserRecord {
            id: "7f1c".into(),
            username: "alice".into(),
            email: Some("alice@example.com".into()),
            display_name: Some("Alice".into()),
            password_hash: Some(hash_password_with_cost(PASSWORD, 4).unwrap()),
            status: UserStatus::Active,
            password_expires_at: None,
            must_change_password: false,
        })
        .await;
    let audit = Arc::new(MemoryAuditLog::new());
    let refresh = Arc::new(MemoryRefreshTokenStore::new());
    let secrets = Arc::new(StaticSecret::new("0123456789abcdef0123456789abcdef").unwrap());
    let clock = Arc::new(ManualClock::at_timestamp(1_700_000_000));

    let core = AuthenticationCore::builder(config, secrets.clone(), users)
        .audit_sink(audit.clone())
        .refresh_tokens(refresh.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    Harness {
        core,
        audit,
        refresh,
        secrets,
        clock,
    }
}

fn ctx() -> RequestContext {
    RequestContext::new(Some("203.0.113.7".parse().unwrap()), Some("integration-test"))
}

async fn login(h: &Harness, password: &str) -> AuthOutcome {
    h.core
        .authenticate_with_password("alice", password, &ctx())
        .await
        .unwrap()
}

#[tokio::test]
async fn alice_locks_after_five_failures_and_recovers() {
    let h = harness(AuthConfig::default()).await;

    for _ in 0..5 {
        let outcome = login(&h, "wrong").await;
        assert_eq!(outcome.rejection(), Some(RejectReason::InvalidCredentials));
    }
    // Correct password while locked.
    let outcome = login(&h, PASSWORD).await;
    assert_eq!(outcome.rejection(), Some(RejectReason::AccountLocked));

    let types = h.audit.event_types().await;
    assert_eq!(
        types
            .iter()
            .filter(|t| **t == AuditEventType::LoginFailure)
            .count(),
        5
    );
    assert_eq!(types[5], AuditEventType::AccountLocked);
    assert_eq!(types.last(), Some(&AuditEventType::LoginBlocked));

    h.clock.advance(Duration::minutes(30) + Duration::seconds(1));
    assert!(login(&h, PASSWORD).await.is_authenticated());
    assert_eq!(
        h.core.lockout().state("alice").await.unwrap().failed_attempts,
        0
    );
}

#[tokio::test]
async fn first_failure_after_lock_expiry_relocks() {
    let h = harness(AuthConfig::default()).await;
    for _ in 0..5 {
        login(&h, "wrong").await;
    }
    h.clock.advance(Duration::minutes(31));
    assert_eq!(
        login(&h, "wrong").await.rejection(),
        Some(RejectReason::InvalidCredentials)
    );
    assert_eq!(
        login(&h, PASSWORD).await.rejection(),
        Some(RejectReason::AccountLocked)
    );
}

#[tokio::test]
async fn access_token_valid_until_exp() {
    let h = harness(AuthConfig::default()).await;
    let outcome = login(&h, PASSWORD).await;
    let tokens = outcome.success().unwrap().tokens.clone();
    assert_eq!(tokens.expires_in, 3600);
    assert_eq!(tokens.token_type, "Bearer");

    h.clock.advance(Duration::seconds(3599));
    let claims = h.core.validate_access_token(&tokens.access_token).unwrap();
    assert_eq!(claims.user.username, "alice");

    h.clock.advance(Duration::seconds(2));
    assert_eq!(
        h.core.validate_access_token(&tokens.access_token),
        Err(TokenRejection::Expired)
    );

    // The refresh token outlives the access token.
    let refreshed = h.core.refresh(&tokens.refresh_token, &ctx()).await.unwrap();
    let new_access = &refreshed.success().unwrap().tokens.access_token;
    assert!(h.core.validate_access_token(new_access).is_ok());
}

#[tokio::test]
async fn rotated_refresh_token_cannot_be_replayed() {
    let h = harness(AuthConfig::default()).await;
    let first = login(&h, PASSWORD).await.success().unwrap().tokens.clone();

    let second = h.core.refresh(&first.refresh_token, &ctx()).await.unwrap();
    let second = second.success().unwrap().tokens.clone();
    assert_ne!(second.refresh_token, first.refresh_token);

    let replay = h.core.refresh(&first.refresh_token, &ctx()).await.unwrap();
    assert_eq!(replay.rejection(), Some(RejectReason::TokenInvalid));

    let third = h.core.refresh(&second.refresh_token, &ctx()).await.unwrap();
    assert!(third.is_authenticated());
    assert_eq!(h.refresh.count_for_user("7f1c").await, 1);

    let types = h.audit.event_types().await;
    assert!(types.contains(&AuditEventType::TokenRefreshed));
    assert!(types.contains(&AuditEventType::TokenRefreshRejected));
}

#[tokio::test]
async fn concurrent_refresh_has_one_winner() {
    let h = Arc::new(harness(AuthConfig::default()).await);
    let tokens = login(&h, PASSWORD).await.success().unwrap().tokens.clone();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let h = Arc::clone(&h);
        let token = tokens.refresh_token.clone();
        tasks.push(tokio::spawn(async move {
            h.core.refresh(&token, &ctx()).await.unwrap().is_authenticated()
        }));
    }
    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn expired_refresh_token_is_rejected() {
    let h = harness(AuthConfig::default()).await;
    let tokens = login(&h, PASSWORD).await.success().unwrap().tokens.clone();
    h.clock.advance(Duration::days(30));
    let outcome = h.core.refresh(&tokens.refresh_token, &ctx()).await.unwrap();
    assert_eq!(outcome.rejection(), Some(RejectReason::TokenExpired));
}

#[tokio::test]
async fn single_session_mode_replaces_previous_login() {
    let h = harness(AuthConfig::default()).await;
    let first = login(&h, PASSWORD).await.success().unwrap().tokens.clone();
    let _second = login(&h, PASSWORD).await;

    let outcome = h.core.refresh(&first.refresh_token, &ctx()).await.unwrap();
    assert_eq!(outcome.rejection(), Some(RejectReason::TokenInvalid));
}

#[tokio::test]
async fn multi_session_mode_keeps_both_logins() {
    let config = AuthConfig {
        refresh_token_mode: RefreshTokenMode::MultiSession,
        ..AuthConfig::default()
    };
    let h = harness(config).await;
    let first = login(&h, PASSWORD).await.success().unwrap().tokens.clone();
    let second = login(&h, PASSWORD).await.success().unwrap().tokens.clone();
    assert_eq!(h.refresh.count_for_user("7f1c").await, 2);

    assert!(h.core.refresh(&first.refresh_token, &ctx()).await.unwrap().is_authenticated());
    assert!(h.core.refresh(&second.refresh_token, &ctx()).await.unwrap().is_authenticated());

    let revoked = h
        .core
        .revoke("7f1c", Some(&second.refresh_token), &ctx())
        .await
        .unwrap();
    // `second` was already rotated away.
    assert_eq!(revoked, 0);
    assert_eq!(h.core.revoke("7f1c", None, &ctx()).await.unwrap(), 2);
}

#[tokio::test]
async fn secret_rotation_invalidates_outstanding_tokens() {
    let h = harness(AuthConfig::default()).await;
    let tokens = login(&h, PASSWORD).await.success().unwrap().tokens.clone();
    h.secrets.rotate().unwrap();
    assert_eq!(
        h.core.validate_access_token(&tokens.access_token),
        Err(TokenRejection::BadSignature)
    );
    let outcome = h.core.refresh(&tokens.refresh_token, &ctx()).await.unwrap();
    assert_eq!(outcome.rejection(), Some(RejectReason::TokenInvalid));
}

#[tokio::test]
async fn success_audit_carries_request_context() {
    let h = harness(AuthConfig::default()).await;
    login(&h, PASSWORD).await;
    let events = h.audit.events().await;
    let event = events.last().unwrap();
    assert_eq!(event.event_type, AuditEventType::LoginSuccess);
    assert_eq!(event.user_id.as_deref(), Some("7f1c"));
    assert_eq!(event.user_agent.as_deref(), Some("integration-test"));
    assert_eq!(event.ip_address, Some("203.0.113.7".parse().unwrap()));
}
