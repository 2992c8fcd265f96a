//! Signing-secret providers.
//!
//! The HMAC secret is generated once, persisted server-side and never sent
//! to clients. Rotating it invalidates every outstanding token.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use super::AuthError;
use crate::random::{OsRandom, RandomSource};

/// Environment variable consulted before the persisted secret file.
pub const SECRET_ENV_VAR: &str = "SUITEGATE_JWT_SECRET";

/// Length of generated secrets (alphanumeric, ~381 bits).
const GENERATED_SECRET_LEN: usize = 64;

/// Minimum accepted secret length in bytes (256 bits).
pub const MIN_SECRET_BYTES: usize = 32;

/// Loads and rotates the token signing secret.
pub trait SecretsProvider: Send + Sync {
    fn current(&self) -> Result<Arc<[u8]>, AuthError>;

    /// Replace the secret with a freshly generated one and return it.
    fn rotate(&self) -> Result<Arc<[u8]>, AuthError>;
}

fn check_length(secret: &[u8]) -> Result<(), AuthError> {
    if secret.len() < MIN_SECRET_BYTES {
        return Err(AuthError::Secret(format!(
            "secret must be at least {MIN_SECRET_BYTES} bytes, got {}",
            secret.len()
        )));
    }
    Ok(())
}

/// In-memory secret.
pub struct StaticSecret {
    secret: RwLock<Arc<[u8]>>,
    random: Arc<dyn RandomSource>,
}

impl StaticSecret {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, AuthError> {
        check_length(secret.as_ref())?;
        Ok(Self {
            secret: RwLock::new(Arc::from(secret.as_ref())),
            random: Arc::new(OsRandom),
        })
    }

    /// Fresh random secret.
    pub fn generate() -> Self {
        let secret = OsRandom.alphanumeric(GENERATED_SECRET_LEN);
        Self {
            secret: RwLock::new(Arc::from(secret.as_bytes())),
            random: Arc::new(OsRandom),
        }
    }
}

impl SecretsProvider for StaticSecret {
    fn current(&self) -> Result<Arc<[u8]>, AuthError> {
        Ok(Arc::clone(
            &self.secret.read().unwrap_or_else(PoisonError::into_inner),
        ))
    }

    fn rotate(&self) -> Result<Arc<[u8]>, AuthError> {
        let fresh: Arc<[u8]> = Arc::from(self.random.alphanumeric(GENERATED_SECRET_LEN).as_bytes());
        *self.secret.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&fresh);
        info!("rotated in-memory signing secret");
        Ok(fresh)
    }
}

/// Secret resolved from `SUITEGATE_JWT_SECRET`, else a persisted file,
/// else generated and written to that file.
pub struct FileSecrets {
    path: PathBuf,
    cached: RwLock<Option<Arc<[u8]>>>,
}

impl FileSecrets {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }

    /// Provider backed by the platform data directory.
    pub fn with_default_path() -> Self {
        Self::new(default_secret_path())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn resolve(&self) -> Result<Arc<[u8]>, AuthError> {
        if let Ok(secret) = std::env::var(SECRET_ENV_VAR)
            && !secret.is_empty()
        {
            check_length(secret.as_bytes())?;
            return Ok(Arc::from(secret.as_bytes()));
        }
        if let Ok(existing) = std::fs::read_to_string(&self.path) {
            let trimmed = existing.trim();
            if !trimmed.is_empty() {
                check_length(trimmed.as_bytes())?;
                return Ok(Arc::from(trimmed.as_bytes()));
            }
        }
        self.generate_and_persist()
    }

    fn generate_and_persist(&self) -> Result<Arc<[u8]>, AuthError> {
        let secret = OsRandom.alphanumeric(GENERATED_SECRET_LEN);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AuthError::Secret(format!("create {}: {e}", parent.display())))?;
        }
        std::fs::write(&self.path, &secret)
            .map_err(|e| AuthError::Secret(format!("write {}: {e}", self.path.display())))?;
        restrict_permissions(&self.path);
        info!(path = %self.path.display(), "generated new JWT secret");
        Ok(Arc::from(secret.as_bytes()))
    }
}

impl SecretsProvider for FileSecrets {
    fn current(&self) -> Result<Arc<[u8]>, AuthError> {
        if let Some(secret) = self
            .cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(Arc::clone(secret));
        }
        let secret = self.resolve()?;
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&secret));
        Ok(secret)
    }

    fn rotate(&self) -> Result<Arc<[u8]>, AuthError> {
        if std::env::var(SECRET_ENV_VAR).is_ok_and(|s| !s.is_empty()) {
            warn!("{SECRET_ENV_VAR} is set; rotated file secret is shadowed until it is unset");
        }
        let secret = self.generate_and_persist()?;
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&secret));
        Ok(secret)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!(path = %path.display(), "could not restrict secret file permissions: {e}");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) {}

/// Path to the persisted JWT secret file.
pub fn default_secret_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("suitegate")
        .join("jwt-secret")
}
