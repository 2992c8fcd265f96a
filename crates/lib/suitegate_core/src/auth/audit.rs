//! Audit events for terminal authentication outcomes.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::auth::{AuthMethod, RequestContext};

/// Audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LoginSuccess,
    LoginFailure,
    LoginBlocked,
    AccountLocked,
    RateLimited,
    PasswordExpired,
    PasswordChangeRequired,
    TwoFactorChallenge,
    TwoFactorFailure,
    TokenRefreshed,
    TokenRefreshRejected,
    TokenRevoked,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::LoginSuccess => "login_success",
            AuditEventType::LoginFailure => "login_failure",
            AuditEventType::LoginBlocked => "login_blocked",
            AuditEventType::AccountLocked => "account_locked",
            AuditEventType::RateLimited => "rate_limited",
            AuditEventType::PasswordExpired => "password_expired",
            AuditEventType::PasswordChangeRequired => "password_change_required",
            AuditEventType::TwoFactorChallenge => "two_factor_challenge",
            AuditEventType::TwoFactorFailure => "two_factor_failure",
            AuditEventType::TokenRefreshed => "token_refreshed",
            AuditEventType::TokenRefreshRejected => "token_refresh_rejected",
            AuditEventType::TokenRevoked => "token_revoked",
        }
    }
}

/// One row of the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub event_type: AuditEventType,
    pub auth_method: AuthMethod,
    pub ip_address: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        auth_method: AuthMethod,
        ctx: &RequestContext,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: None,
            username: None,
            event_type,
            auth_method,
            ip_address: ctx.ip_address,
            user_agent: ctx.user_agent.clone(),
            session_id: None,
            details: serde_json::Value::Null,
            created_at,
        }
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_carries_request_context() {
        let ctx = RequestContext::new(Some("10.1.2.3".parse().unwrap()), Some("curl/8"));
        let event = AuditEvent::new(
            AuditEventType::LoginFailure,
            AuthMethod::Password,
            &ctx,
            Utc::now(),
        )
        .username("alice")
        .details(serde_json::json!({ "reason": "invalid_credentials" }));

        assert_eq!(event.username.as_deref(), Some("alice"));
        assert_eq!(event.ip_address, ctx.ip_address);
        assert_eq!(event.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(event.details["reason"], "invalid_credentials");
    }

    #[test]
    fn event_type_serializes_snake_case() {
        let json = serde_json::to_value(AuditEventType::TokenRefreshRejected).unwrap();
        assert_eq!(json, AuditEventType::TokenRefreshRejected.as_str());
    }
}
