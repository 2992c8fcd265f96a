//! Configuration for the authentication core and the connection pool.
//!
//! Every field has a default, so an empty YAML document is a valid
//! configuration apart from the server list, which must name at least one
//! primary before a pool can be built.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Access token lifetime: 1 hour.
pub const DEFAULT_ACCESS_TTL_SECS: i64 = 3600;

/// Refresh token lifetime: 30 days.
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 30 * 24 * 3600;

/// Failed attempts before an account is locked.
pub const DEFAULT_LOCKOUT_THRESHOLD: u32 = 5;

/// Lock duration: 30 minutes.
pub const DEFAULT_LOCKOUT_DURATION_SECS: i64 = 30 * 60;

/// Upper bound for every auth duration setting: 10 years.
pub const MAX_DURATION_SECS: i64 = 10 * 365 * 24 * 3600;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub auth: AuthConfig,
    pub pool: PoolConfig,
}

impl CoreConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.auth.validate()?;
        self.pool.validate()
    }
}

/// How refresh-token records are keyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTokenMode {
    /// One live refresh token per user; issuing a new one replaces the old.
    #[default]
    SingleSession,
    /// Records keyed on (user, token hash); sessions coexist.
    MultiSession,
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub lockout_threshold: u32,
    pub lockout_duration_secs: i64,
    /// Attempts allowed per identifier within one rate-limit window.
    pub rate_limit_attempts: u32,
    pub rate_limit_window_secs: i64,
    /// Lifetime of a pending two-factor marker.
    pub two_factor_ttl_secs: i64,
    pub refresh_token_mode: RefreshTokenMode,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
            refresh_ttl_secs: DEFAULT_REFRESH_TTL_SECS,
            lockout_threshold: DEFAULT_LOCKOUT_THRESHOLD,
            lockout_duration_secs: DEFAULT_LOCKOUT_DURATION_SECS,
            rate_limit_attempts: 20,
            rate_limit_window_secs: 60,
            two_factor_ttl_secs: 300,
            refresh_token_mode: RefreshTokenMode::SingleSession,
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, secs) in [
            ("access_ttl_secs", self.access_ttl_secs),
            ("refresh_ttl_secs", self.refresh_ttl_secs),
            ("lockout_duration_secs", self.lockout_duration_secs),
            ("rate_limit_window_secs", self.rate_limit_window_secs),
            ("two_factor_ttl_secs", self.two_factor_ttl_secs),
        ] {
            check_duration(name, secs)?;
        }
        if self.refresh_ttl_secs < self.access_ttl_secs {
            return Err(ConfigError::Invalid(
                "refresh TTL must not be shorter than access TTL".into(),
            ));
        }
        if self.lockout_threshold == 0 {
            return Err(ConfigError::Invalid("lockout threshold must be >= 1".into()));
        }
        if self.rate_limit_attempts == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit_attempts must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

fn check_duration(name: &str, secs: i64) -> Result<(), ConfigError> {
    if !(1..=MAX_DURATION_SECS).contains(&secs) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be between 1 and {MAX_DURATION_SECS} seconds, got {secs}"
        )));
    }
    Ok(())
}

/// Server selection strategy for new connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
}

/// Server role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Primary,
    Replica,
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRole::Primary => f.write_str("primary"),
            ServerRole::Replica => f.write_str("replica"),
        }
    }
}

/// Static description of one database endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub role: ServerRole,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Per-server cap. Derived from the pool's role shares when absent.
    #[serde(default)]
    pub max_connections: Option<u32>,
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "suitecrm".into()
}

fn default_username() -> String {
    "suitecrm".into()
}

fn default_weight() -> u32 {
    1
}

/// Connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    pub idle_timeout_secs: u64,
    pub connection_timeout_secs: u64,
    pub health_check_timeout_secs: u64,
    pub load_balancing: LoadBalancingStrategy,
    /// Fail instead of opening past `max_pool_size` when nothing is idle.
    pub strict_pool_limit: bool,
    pub max_connect_retries: u32,
    /// Fraction of pool capacity reserved for primaries when replicas exist.
    pub primary_share: f64,
    pub servers: Vec<ServerConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 20,
            min_pool_size: 5,
            idle_timeout_secs: 300,
            connection_timeout_secs: 30,
            health_check_timeout_secs: 5,
            load_balancing: LoadBalancingStrategy::RoundRobin,
            strict_pool_limit: false,
            max_connect_retries: 3,
            primary_share: 0.7,
            servers: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::Invalid("max_pool_size must be >= 1".into()));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(ConfigError::Invalid(
                "min_pool_size must not exceed max_pool_size".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.primary_share) {
            return Err(ConfigError::Invalid(
                "primary_share must be between 0 and 1".into(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
            if server.weight == 0 {
                return Err(ConfigError::Invalid(format!(
                    "server '{}' has zero weight",
                    server.name
                )));
            }
            if server.max_connections == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "server '{}' has max_connections = 0",
                    server.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = CoreConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.auth.access_ttl_secs, 3600);
        assert_eq!(config.auth.refresh_ttl_secs, 30 * 24 * 3600);
        assert_eq!(config.auth.lockout_threshold, 5);
        assert_eq!(config.auth.lockout_duration_secs, 1800);
        assert_eq!(config.pool.max_pool_size, 20);
        assert_eq!(config.pool.min_pool_size, 5);
        assert_eq!(config.pool.idle_timeout_secs, 300);
        assert_eq!(config.pool.connection_timeout_secs, 30);
        assert_eq!(config.pool.load_balancing, LoadBalancingStrategy::RoundRobin);
        assert_eq!(config.auth.refresh_token_mode, RefreshTokenMode::SingleSession);
    }

    #[test]
    fn parses_servers_and_strategy() {
        let yaml = r#"
pool:
  load_balancing: least_connections
  servers:
    - name: db1
      role: primary
      host: 10.0.0.1
      password: hunter2
    - name: db2
      role: replica
      host: 10.0.0.2
      port: 6432
      weight: 3
auth:
  refresh_token_mode: multi_session
"#;
        let config = CoreConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.pool.load_balancing,
            LoadBalancingStrategy::LeastConnections
        );
        assert_eq!(config.pool.servers.len(), 2);
        assert_eq!(config.pool.servers[0].port, 5432);
        assert_eq!(config.pool.servers[0].password.as_deref(), Some("hunter2"));
        assert_eq!(config.pool.servers[1].role, ServerRole::Replica);
        assert_eq!(config.pool.servers[1].weight, 3);
        assert_eq!(config.auth.refresh_token_mode, RefreshTokenMode::MultiSession);
    }

    #[test]
    fn rejects_duplicate_server_names() {
        let yaml = r#"
pool:
  servers:
    - { name: db, role: primary, host: a }
    - { name: db, role: replica, host: b }
"#;
        assert!(matches!(
            CoreConfig::from_yaml_str(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_zero_lockout_threshold() {
        let yaml = "auth:\n  lockout_threshold: 0\n";
        assert!(CoreConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn rejects_out_of_range_durations() {
        let huge = AuthConfig {
            access_ttl_secs: i64::MAX / 2,
            refresh_ttl_secs: i64::MAX / 2,
            ..AuthConfig::default()
        };
        let err = huge.validate().unwrap_err();
        assert!(err.to_string().contains("access_ttl_secs"));

        let no_two_factor_window = AuthConfig {
            two_factor_ttl_secs: 0,
            ..AuthConfig::default()
        };
        assert!(no_two_factor_window.validate().is_err());

        let ten_years = AuthConfig {
            refresh_ttl_secs: MAX_DURATION_SECS,
            lockout_duration_secs: MAX_DURATION_SECS,
            ..AuthConfig::default()
        };
        assert!(ten_years.validate().is_ok());
    }

    #[test]
    fn rejects_min_above_max() {
        let yaml = "pool:\n  max_pool_size: 2\n  min_pool_size: 3\n";
        assert!(CoreConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn password_is_not_serialized() {
        let server = ServerConfig {
            name: "db".into(),
            role: ServerRole::Primary,
            host: "localhost".into(),
            port: 5432,
            database: "crm".into(),
            username: "crm".into(),
            password: Some("secret".into()),
            weight: 1,
            max_connections: None,
        };
        let yaml = serde_yaml::to_string(&server).unwrap();
        assert!(!yaml.contains("secret"));
    }
}
