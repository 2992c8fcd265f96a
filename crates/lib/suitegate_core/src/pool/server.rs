//! Per-server runtime state.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{PoolConfig, ServerConfig, ServerRole};

/// Health of a configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Active,
    /// Set after a failed connection attempt or probe; cleared only by a
    /// successful health check.
    Failed,
}

#[derive(Debug)]
pub(crate) struct ServerState {
    pub config: ServerConfig,
    pub max_connections: usize,
    /// Open entries plus connections being opened.
    pub current_connections: usize,
    pub status: ServerStatus,
    pub failure_count: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ServerState {
    pub fn new(config: ServerConfig, max_connections: usize) -> Self {
        Self {
            config,
            max_connections,
            current_connections: 0,
            status: ServerStatus::Active,
            failure_count: 0,
            last_health_check: None,
            last_error: None,
        }
    }

    pub fn role(&self) -> ServerRole {
        self.config.role
    }

    pub fn is_active(&self) -> bool {
        self.status == ServerStatus::Active
    }

    pub fn has_capacity(&self) -> bool {
        self.current_connections < self.max_connections
    }

    /// Returns `true` when this call changed the status.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        let changed = self.status == ServerStatus::Active;
        self.status = ServerStatus::Failed;
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_error = Some(error.into());
        changed
    }

    /// Returns `true` when this call changed the status.
    pub fn mark_healthy(&mut self, now: DateTime<Utc>) -> bool {
        let changed = self.status == ServerStatus::Failed;
        self.status = ServerStatus::Active;
        self.last_health_check = Some(now);
        self.last_error = None;
        changed
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            name: self.config.name.clone(),
            role: self.config.role,
            host: self.config.host.clone(),
            port: self.config.port,
            weight: self.config.weight,
            status: self.status,
            max_connections: self.max_connections,
            current_connections: self.current_connections,
            failure_count: self.failure_count,
            last_health_check: self.last_health_check,
            last_error: self.last_error.clone(),
        }
    }
}

/// Point-in-time view of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub role: ServerRole,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub status: ServerStatus,
    pub max_connections: usize,
    pub current_connections: usize,
    pub failure_count: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Connection cap for each configured server, in configuration order.
///
/// An explicit `max_connections` wins. Otherwise primaries split
/// `primary_share` of the pool and replicas split the rest; with only one
/// role configured that role gets the whole pool.
pub(crate) fn derive_caps(config: &PoolConfig) -> Vec<usize> {
    let primaries = config
        .servers
        .iter()
        .filter(|s| s.role == ServerRole::Primary)
        .count();
    let replicas = config.servers.len() - primaries;
    let max = config.max_pool_size;

    let primary_total = match (primaries, replicas) {
        (0, _) => 0,
        (_, 0) => max,
        _ => ((max as f64) * config.primary_share).round() as usize,
    };
    let replica_total = max.saturating_sub(primary_total);

    config
        .servers
        .iter()
        .map(|server| {
            if let Some(cap) = server.max_connections {
                return cap as usize;
            }
            let (total, count) = match server.role {
                ServerRole::Primary => (primary_total, primaries),
                ServerRole::Replica => (replica_total, replicas),
            };
            total.div_ceil(count.max(1)).max(1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, role: ServerRole) -> ServerConfig {
        ServerConfig {
            name: name.into(),
            role,
            host: "localhost".into(),
            port: 5432,
            database: "crm".into(),
            username: "crm".into(),
            password: None,
            weight: 1,
            max_connections: None,
        }
    }

    #[test]
    fn primary_takes_seventy_percent() {
        let config = PoolConfig {
            servers: vec![
                server("p", ServerRole::Primary),
                server("r1", ServerRole::Replica),
                server("r2", ServerRole::Replica),
            ],
            ..PoolConfig::default()
        };
        assert_eq!(derive_caps(&config), vec![14, 3, 3]);
    }

    #[test]
    fn lone_primary_gets_whole_pool() {
        let config = PoolConfig {
            servers: vec![server("p", ServerRole::Primary)],
            ..PoolConfig::default()
        };
        assert_eq!(derive_caps(&config), vec![20]);
    }

    #[test]
    fn explicit_cap_wins() {
        let mut replica = server("r", ServerRole::Replica);
        replica.max_connections = Some(2);
        let config = PoolConfig {
            servers: vec![server("p", ServerRole::Primary), replica],
            ..PoolConfig::default()
        };
        assert_eq!(derive_caps(&config), vec![14, 2]);
    }

    #[test]
    fn failure_and_recovery_transitions() {
        let mut state = ServerState::new(server("p", ServerRole::Primary), 5);
        assert!(state.mark_failed("refused"));
        assert!(!state.mark_failed("refused again"));
        assert_eq!(state.failure_count, 2);
        assert!(!state.is_active());

        let now = Utc::now();
        assert!(state.mark_healthy(now));
        assert_eq!(state.snapshot().last_health_check, Some(now));
        assert_eq!(state.snapshot().last_error, None);
    }
}
