//! JWT token generation and verification.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use super::AuthError;
use super::secrets::SecretsProvider;
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::models::auth::{SessionClaims, TokenPair, TokenType, UserInfo};

/// Why a token was not accepted. Every variant means "not authenticated";
/// only [`TokenRejection::SecretUnavailable`] points at the server rather
/// than the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenRejection {
    #[error("token expired")]
    Expired,

    #[error("token malformed")]
    Malformed,

    #[error("token signature invalid")]
    BadSignature,

    #[error("unexpected token type")]
    WrongType,

    /// The signing secret could not be loaded; the token was not checked.
    #[error("signing secret unavailable")]
    SecretUnavailable,
}

/// A signed token with its claims.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: SessionClaims,
}

impl IssuedToken {
    pub fn expires_at(&self) -> DateTime<Utc> {
        timestamp(self.claims.exp)
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Signs and verifies session tokens with HS256.
pub struct TokenCodec {
    secrets: Arc<dyn SecretsProvider>,
    clock: Arc<dyn Clock>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenCodec {
    pub fn new(
        secrets: Arc<dyn SecretsProvider>,
        clock: Arc<dyn Clock>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            secrets,
            clock,
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn from_config(
        config: &AuthConfig,
        secrets: Arc<dyn SecretsProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            secrets,
            clock,
            Duration::seconds(config.access_ttl_secs),
            Duration::seconds(config.refresh_ttl_secs),
        )
    }

    pub fn ttl(&self, token_type: TokenType) -> Duration {
        match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        }
    }

    /// Sign a new token for `subject`.
    pub fn issue(
        &self,
        subject: &str,
        user: &UserInfo,
        token_type: TokenType,
    ) -> Result<IssuedToken, AuthError> {
        let now = self.clock.now();
        let claims = SessionClaims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl(token_type)).timestamp(),
            jti: Uuid::new_v4().to_string(),
            typ: token_type,
            user: user.clone(),
        };
        let secret = self.secrets.current()?;
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&secret),
        )
        .map_err(|e| AuthError::Token(format!("jwt encode: {e}")))?;
        Ok(IssuedToken { token, claims })
    }

    /// Sign an access + refresh pair.
    pub fn issue_pair(
        &self,
        subject: &str,
        user: &UserInfo,
    ) -> Result<(TokenPair, IssuedToken), AuthError> {
        let access = self.issue(subject, user, TokenType::Access)?;
        let refresh = self.issue(subject, user, TokenType::Refresh)?;
        let pair = TokenPair {
            access_token: access.token.clone(),
            refresh_token: refresh.token.clone(),
            expires_in: self.access_ttl.num_seconds(),
            token_type: "Bearer".to_string(),
            access_expires_at: access.expires_at(),
            refresh_expires_at: refresh.expires_at(),
            session_id: access.claims.jti.clone(),
        };
        Ok((pair, refresh))
    }

    /// Check signature integrity and expiry.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenRejection> {
        let secret = self.secrets.current().map_err(|e| {
            error!("cannot load signing secret for verification: {e}");
            TokenRejection::SecretUnavailable
        })?;
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock below.
        validation.validate_exp = false;
        validation.leeway = 0;

        let claims = decode::<SessionClaims>(token, &DecodingKey::from_secret(&secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => TokenRejection::BadSignature,
                ErrorKind::ExpiredSignature => TokenRejection::Expired,
                _ => TokenRejection::Malformed,
            })?;

        if self.clock.now().timestamp() >= claims.exp {
            return Err(TokenRejection::Expired);
        }
        Ok(claims)
    }

    /// Verify and require a specific token type.
    pub fn verify_typed(
        &self,
        token: &str,
        expected: TokenType,
    ) -> Result<SessionClaims, TokenRejection> {
        let claims = self.verify(token)?;
        if claims.typ != expected {
            return Err(TokenRejection::WrongType);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::secrets::StaticSecret;
    use crate::clock::ManualClock;
    use crate::models::auth::AuthMethod;

    fn user() -> UserInfo {
        UserInfo {
            username: "alice".into(),
            email: Some("alice@example.com".into()),
            display_name: Some("Alice".into()),
            auth_method: AuthMethod::Password,
        }
    }

    fn codec(clock: Arc<ManualClock>) -> (TokenCodec, Arc<StaticSecret>) {
        let secrets = Arc::new(StaticSecret::new([42u8; 32]).unwrap());
        let codec = TokenCodec::new(
            secrets.clone(),
            clock,
            Duration::seconds(3600),
            Duration::days(30),
        );
        (codec, secrets)
    }

    #[test]
    fn verify_returns_issued_claims() {
        let clock = Arc::new(ManualClock::at_timestamp(1_700_000_000));
        let (codec, _) = codec(clock);
        let issued = codec.issue("u-1", &user(), TokenType::Access).unwrap();
        let claims = codec.verify(&issued.token).unwrap();
        assert_eq!(claims, issued.claims);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn access_token_expires_after_ttl() {
        let clock = Arc::new(ManualClock::at_timestamp(0));
        let (codec, _) = codec(clock.clone());
        let issued = codec.issue("u-1", &user(), TokenType::Access).unwrap();

        clock.advance(Duration::seconds(3599));
        assert!(codec.verify(&issued.token).is_ok());

        clock.advance(Duration::seconds(2));
        assert_eq!(codec.verify(&issued.token), Err(TokenRejection::Expired));
    }

    #[test]
    fn refresh_token_uses_refresh_ttl() {
        let clock = Arc::new(ManualClock::at_timestamp(1_000));
        let (codec, _) = codec(clock);
        let issued = codec.issue("u-1", &user(), TokenType::Refresh).unwrap();
        assert_eq!(issued.claims.exp - issued.claims.iat, 30 * 24 * 3600);
    }

    #[test]
    fn tampered_token_has_bad_signature() {
        let clock = Arc::new(ManualClock::at_timestamp(1_700_000_000));
        let (codec, _) = codec(clock.clone());
        let issued = codec.issue("u-1", &user(), TokenType::Access).unwrap();

        let other = TokenCodec::new(
            Arc::new(StaticSecret::new([9u8; 32]).unwrap()),
            clock,
            Duration::seconds(3600),
            Duration::days(30),
        );
        assert_eq!(other.verify(&issued.token), Err(TokenRejection::BadSignature));
    }

    #[test]
    fn garbage_is_malformed() {
        let clock = Arc::new(ManualClock::at_timestamp(1_700_000_000));
        let (codec, _) = codec(clock);
        assert_eq!(codec.verify("not-a-jwt"), Err(TokenRejection::Malformed));
        assert_eq!(codec.verify(""), Err(TokenRejection::Malformed));
    }

    #[test]
    fn rotating_secret_invalidates_outstanding_tokens() {
        let clock = Arc::new(ManualClock::at_timestamp(1_700_000_000));
        let (codec, secrets) = codec(clock);
        let issued = codec.issue("u-1", &user(), TokenType::Access).unwrap();
        secrets.rotate().unwrap();
        assert_eq!(codec.verify(&issued.token), Err(TokenRejection::BadSignature));
    }

    #[test]
    fn verify_typed_rejects_wrong_type() {
        let clock = Arc::new(ManualClock::at_timestamp(1_700_000_000));
        let (codec, _) = codec(clock);
        let issued = codec.issue("u-1", &user(), TokenType::Access).unwrap();
        assert_eq!(
            codec.verify_typed(&issued.token, TokenType::Refresh),
            Err(TokenRejection::WrongType)
        );
    }

    #[test]
    fn pair_tokens_are_distinct() {
        let clock = Arc::new(ManualClock::at_timestamp(1_700_000_000));
        let (codec, _) = codec(clock);
        let (pair, refresh) = codec.issue_pair("u-1", &user()).unwrap();
        assert_ne!(pair.access_token, pair.refresh_token);
        assert_eq!(pair.refresh_token, refresh.token);
        assert_eq!(pair.expires_in, 3600);
        assert_eq!(pair.token_type, "Bearer");
    }

    struct FlakySecrets {
        inner: StaticSecret,
        down: std::sync::atomic::AtomicBool,
    }

    impl SecretsProvider for FlakySecrets {
        fn current(&self) -> Result<Arc<[u8]>, AuthError> {
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(AuthError::Secret("secret file unreadable".into()));
            }
            self.inner.current()
        }

        fn rotate(&self) -> Result<Arc<[u8]>, AuthError> {
            self.inner.rotate()
        }
    }

    #[test]
    fn secret_outage_is_not_a_bad_signature() {
        let secrets = Arc::new(FlakySecrets {
            inner: StaticSecret::new([42u8; 32]).unwrap(),
            down: Default::default(),
        });
        let codec = TokenCodec::new(
            secrets.clone(),
            Arc::new(ManualClock::at_timestamp(1_700_000_000)),
            Duration::seconds(3600),
            Duration::days(30),
        );
        let issued = codec.issue("u-1", &user(), TokenType::Access).unwrap();
        secrets.down.store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(
            codec.verify(&issued.token),
            Err(TokenRejection::SecretUnavailable)
        );
    }
}
