//! Authentication core.
//!
//! Token issuance and verification, refresh-token rotation, failed-login
//! lockout, rate limiting and audit, orchestrated by
//! [`service::AuthenticationCore`].

pub mod audit;
pub mod jwt;
pub mod lockout;
pub mod memory;
pub mod password;
pub mod queries;
pub mod rate_limit;
pub mod secrets;
pub mod service;
pub mod store;

use thiserror::Error;

pub use service::{AuthOutcome, AuthSuccess, AuthenticationCore, RejectReason};

/// Authentication errors.
///
/// Local rejections (bad password, lockout, stale token) are not errors; they
/// are returned as [`AuthOutcome::Rejected`]. These variants are reserved for
/// conditions a caller should retry or escalate.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication backend unavailable: {0}")]
    Unavailable(String),

    #[error("Token error: {0}")]
    Token(String),

    #[error("Secret error: {0}")]
    Secret(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Whether the caller should back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Unavailable(_))
    }
}

impl From<store::StoreError> for AuthError {
    fn from(e: store::StoreError) -> Self {
        AuthError::Unavailable(e.to_string())
    }
}
