//! Pooled connections over a primary/replica server set.
//!
//! Read-only requests prefer replicas and fall back to the primary. Failed
//! servers are skipped until a health check succeeds. The pool never waits for
//! a connection to be returned: it reuses an idle entry, evicts the oldest
//! idle entry to make room, opens past the soft limit or fails fast.
//!
//! Pool state sits behind a single mutex that is never held across an
//! `.await`.

mod balancer;
pub mod connector;
pub mod postgres;
pub mod server;
#[cfg(test)]
pub(crate) mod testutil;

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub use connector::{ConnectError, Connector, DbConnection};
pub use postgres::PgConnector;
pub use server::{ServerSnapshot, ServerStatus};

use balancer::Balancer;
use server::{ServerState, derive_caps};

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, PoolConfig, ServerRole};
use crate::random::{OsRandom, RandomSource};

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No database server available: {0}")]
    NoServerAvailable(String),

    #[error("Connection pool exhausted: maximum {0} connections reached")]
    PoolExhausted(usize),

    #[error("Connection pool is shut down")]
    Closed,

    #[error("Invalid pool configuration: {0}")]
    Config(String),
}

impl From<ConfigError> for PoolError {
    fn from(e: ConfigError) -> Self {
        PoolError::Config(e.to_string())
    }
}

/// Result of [`ConnectionPool::health_check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy_servers: usize,
    pub total_servers: usize,
    pub pool_size: usize,
    pub active: usize,
    pub idle: usize,
    /// Idle entries dropped by this check.
    pub evicted: usize,
}

/// Current pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub active: usize,
    pub idle: usize,
    /// Connections being opened.
    pub pending: usize,
    pub max_size: usize,
}

struct Entry<T> {
    id: u64,
    server: usize,
    /// `Some` while idle, `None` while checked out.
    conn: Option<T>,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
}

impl<T> Entry<T> {
    fn is_idle(&self) -> bool {
        self.conn.is_some()
    }
}

struct PoolState<T> {
    servers: Vec<ServerState>,
    entries: Vec<Entry<T>>,
    pending: usize,
    next_id: u64,
    closed: bool,
}

impl<T> PoolState<T> {
    fn size(&self) -> usize {
        self.entries.len() + self.pending
    }

    fn stats(&self, max_size: usize) -> PoolStats {
        let idle = self.entries.iter().filter(|e| e.is_idle()).count();
        PoolStats {
            size: self.size(),
            active: self.entries.len() - idle,
            idle,
            pending: self.pending,
            max_size,
        }
    }

    fn can_open(&self, role: ServerRole) -> bool {
        self.servers
            .iter()
            .any(|s| s.role() == role && s.is_active() && s.has_capacity())
    }

    /// Check out an idle entry for a request. Reads take an idle replica
    /// first and reuse an idle primary only when no replica can take a new
    /// connection either.
    fn take_idle_for(
        &mut self,
        read_only: bool,
        now: DateTime<Utc>,
    ) -> Option<(u64, usize, T)> {
        if read_only {
            if let Some(hit) = self.take_idle(ServerRole::Replica, now) {
                return Some(hit);
            }
            if self.can_open(ServerRole::Replica) {
                return None;
            }
        }
        self.take_idle(ServerRole::Primary, now)
    }

    /// Servers a new connection may be opened on.
    fn candidates(&self, read_only: bool, excluded: &[usize]) -> Vec<usize> {
        let eligible = |role: ServerRole| -> Vec<usize> {
            self.servers
                .iter()
                .enumerate()
                .filter(|(i, s)| {
                    s.role() == role && s.is_active() && s.has_capacity() && !excluded.contains(i)
                })
                .map(|(i, _)| i)
                .collect()
        };
        if read_only {
            let replicas = eligible(ServerRole::Replica);
            if !replicas.is_empty() {
                return replicas;
            }
        }
        eligible(ServerRole::Primary)
    }

    /// Check out the most recently used idle entry of `role`.
    fn take_idle(&mut self, role: ServerRole, now: DateTime<Utc>) -> Option<(u64, usize, T)> {
        let servers = &self.servers;
        let pos = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.is_idle() && servers[e.server].role() == role && servers[e.server].is_active()
            })
            .max_by_key(|(_, e)| e.last_used_at)
            .map(|(i, _)| i)?;
        let entry = &mut self.entries[pos];
        entry.last_used_at = now;
        entry.conn.take().map(|conn| (entry.id, entry.server, conn))
    }

    /// Remove entries matching `pred`, returning the idle connections.
    fn evict_where(&mut self, pred: impl Fn(&Entry<T>, &ServerState) -> bool) -> Vec<T> {
        let servers = &mut self.servers;
        let mut evicted = Vec::new();
        self.entries.retain_mut(|entry| {
            if !pred(entry, &servers[entry.server]) {
                return true;
            }
            let server = &mut servers[entry.server];
            server.current_connections = server.current_connections.saturating_sub(1);
            if let Some(conn) = entry.conn.take() {
                evicted.push(conn);
            }
            false
        });
        evicted
    }

    fn evict_oldest_idle(&mut self) -> Option<T> {
        let pos = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_idle())
            .min_by_key(|(_, e)| e.last_used_at)
            .map(|(i, _)| i)?;
        let entry = self.entries.remove(pos);
        let server = &mut self.servers[entry.server];
        server.current_connections = server.current_connections.saturating_sub(1);
        debug!(
            server = %server.config.name,
            lifetime_secs = (entry.last_used_at - entry.created_at).num_seconds(),
            "evicted oldest idle connection"
        );
        entry.conn
    }

    fn remove_entry(&mut self, id: u64) -> Option<Entry<T>> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        let entry = self.entries.remove(pos);
        let server = &mut self.servers[entry.server];
        server.current_connections = server.current_connections.saturating_sub(1);
        Some(entry)
    }
}

struct Shared<T> {
    state: Mutex<PoolState<T>>,
    clock: Arc<dyn Clock>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a checked-out connection. A second return of the same entry is
    /// a no-op; the surplus connection is handed back to be dropped.
    fn check_in(&self, id: u64, conn: T) -> Option<T> {
        let now = self.clock.now();
        let mut state = self.lock();
        let closed = state.closed;
        let Some(pos) = state.entries.iter().position(|e| e.id == id) else {
            return Some(conn);
        };
        let entry = &state.entries[pos];
        if entry.is_idle() {
            return Some(conn);
        }
        if closed || !state.servers[entry.server].is_active() {
            state.remove_entry(id);
            return Some(conn);
        }
        let entry = &mut state.entries[pos];
        entry.conn = Some(conn);
        entry.last_used_at = now;
        None
    }

    fn forget(&self, id: u64) {
        self.lock().remove_entry(id);
    }
}

/// Accounts for a connection being opened. Dropping it without
/// [`Reservation::commit`] (connect failure, timeout or a cancelled
/// `acquire`) gives the slot back.
struct Reservation<T> {
    shared: Arc<Shared<T>>,
    server: usize,
    armed: bool,
}

impl<T: DbConnection> Reservation<T> {
    fn commit(mut self, conn: T, server_name: &str, role: ServerRole) -> ConnectionHandle<T> {
        let now = self.shared.clock.now();
        let id = {
            let mut state = self.shared.lock();
            state.pending = state.pending.saturating_sub(1);
            let id = state.next_id;
            state.next_id += 1;
            state.entries.push(Entry {
                id,
                server: self.server,
                conn: None,
                created_at: now,
                last_used_at: now,
            });
            id
        };
        self.armed = false;
        ConnectionHandle {
            conn: Some(conn),
            entry_id: id,
            server: server_name.to_string(),
            role,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Reservation<T> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            state.pending = state.pending.saturating_sub(1);
            let server = &mut state.servers[self.server];
            server.current_connections = server.current_connections.saturating_sub(1);
        }
    }
}

/// A checked-out connection. Returned to the pool on [`release`] or drop.
///
/// [`release`]: ConnectionHandle::release
pub struct ConnectionHandle<T: DbConnection> {
    conn: Option<T>,
    entry_id: u64,
    server: String,
    role: ServerRole,
    shared: Arc<Shared<T>>,
}

impl<T: DbConnection> ConnectionHandle<T> {
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    pub fn id(&self) -> u64 {
        self.entry_id
    }

    /// Return the connection to the idle set.
    pub fn release(self) {}

    /// Drop the connection instead of returning it, e.g. after an I/O error.
    pub fn discard(mut self) {
        self.conn = None;
        self.shared.forget(self.entry_id);
    }
}

impl<T: DbConnection> Deref for ConnectionHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl<T: DbConnection> DerefMut for ConnectionHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl<T: DbConnection> Drop for ConnectionHandle<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Surplus connections close on drop, outside the lock.
            drop(self.shared.check_in(self.entry_id, conn));
        }
    }
}

impl<T: DbConnection> std::fmt::Debug for ConnectionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.entry_id)
            .field("server", &self.server)
            .field("role", &self.role)
            .finish()
    }
}

/// Connection pool over the configured servers.
pub struct ConnectionPool<C: Connector> {
    config: PoolConfig,
    connector: C,
    balancer: Balancer,
    shared: Arc<Shared<C::Connection>>,
    idle_limit: chrono::Duration,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(config: PoolConfig, connector: C) -> Result<Self, PoolError> {
        Self::with_sources(config, connector, Arc::new(SystemClock), Arc::new(OsRandom))
    }

    pub fn with_sources(
        config: PoolConfig,
        connector: C,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        if !config.servers.iter().any(|s| s.role == ServerRole::Primary) {
            return Err(PoolError::Config(
                "at least one primary server is required".into(),
            ));
        }

        let servers = config
            .servers
            .iter()
            .cloned()
            .zip(derive_caps(&config))
            .map(|(server, cap)| ServerState::new(server, cap))
            .collect();
        let idle_limit = chrono::Duration::from_std(config.idle_timeout())
            .map_err(|e| PoolError::Config(format!("idle_timeout_secs: {e}")))?;

        info!(
            servers = config.servers.len(),
            max_pool_size = config.max_pool_size,
            strategy = ?config.load_balancing,
            "connection pool created"
        );

        Ok(Self {
            balancer: Balancer::new(config.load_balancing, random),
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    servers,
                    entries: Vec::new(),
                    pending: 0,
                    next_id: 1,
                    closed: false,
                }),
                clock,
            }),
            idle_limit,
            connector,
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection. `read_only` routes to a replica when one is
    /// usable and to the primary otherwise.
    pub async fn acquire(
        &self,
        read_only: bool,
    ) -> Result<ConnectionHandle<C::Connection>, PoolError> {
        loop {
            let (candidate, expired) = {
                let now = self.shared.clock.now();
                let idle_limit = self.idle_limit;
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                let expired =
                    state.evict_where(|e, _| e.is_idle() && now - e.last_used_at > idle_limit);
                (state.take_idle_for(read_only, now), expired)
            };
            if !expired.is_empty() {
                debug!(count = expired.len(), "closing idle-timed-out connections");
                close_all(expired).await;
            }

            let Some((id, server, conn)) = candidate else {
                break;
            };
            let server_config = &self.config.servers[server];
            let mut handle = ConnectionHandle {
                conn: Some(conn),
                entry_id: id,
                server: server_config.name.clone(),
                role: server_config.role,
                shared: Arc::clone(&self.shared),
            };
            match timeout(self.config.health_check_timeout(), handle.ping()).await {
                Ok(Ok(())) => {
                    debug!(server = %handle.server, id, "reusing idle connection");
                    return Ok(handle);
                }
                Ok(Err(e)) => {
                    debug!(server = %handle.server, id, "idle connection failed probe: {e}");
                    handle.discard();
                }
                Err(_) => {
                    debug!(server = %handle.server, id, "idle connection probe timed out");
                    handle.discard();
                }
            }
        }

        self.open_new(read_only).await
    }

    /// Return a handle; equivalent to dropping it.
    pub fn release(&self, handle: ConnectionHandle<C::Connection>) {
        handle.release();
    }

    async fn open_new(
        &self,
        read_only: bool,
    ) -> Result<ConnectionHandle<C::Connection>, PoolError> {
        let max = self.config.max_pool_size;
        let mut excluded = Vec::new();
        let mut last_error = None;

        for _ in 0..=self.config.max_connect_retries {
            let (reservation, evicted) = {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                let candidates = state.candidates(read_only, &excluded);
                let Some(index) = self.balancer.select(&candidates, &state.servers) else {
                    break;
                };
                let evicted = if state.size() >= max {
                    let evicted = state.evict_oldest_idle();
                    if evicted.is_none() {
                        if self.config.strict_pool_limit {
                            warn!(max, "connection pool exhausted");
                            return Err(PoolError::PoolExhausted(max));
                        }
                        debug!(max, "opening past soft pool limit");
                    }
                    evicted
                } else {
                    None
                };
                state.servers[index].current_connections += 1;
                state.pending += 1;
                let reservation = Reservation {
                    shared: Arc::clone(&self.shared),
                    server: index,
                    armed: true,
                };
                (reservation, evicted)
            };
            if let Some(conn) = evicted {
                close_all(vec![conn]).await;
            }

            let index = reservation.server;
            let server = &self.config.servers[index];
            let connect_timeout = self.config.connection_timeout();
            let failure = match timeout(connect_timeout, self.connector.connect(server)).await {
                Ok(Ok(conn)) => {
                    debug!(server = %server.name, role = %server.role, "opened connection");
                    return Ok(reservation.commit(conn, &server.name, server.role));
                }
                Ok(Err(e)) => e,
                Err(_) => ConnectError::Timeout(connect_timeout),
            };
            drop(reservation);
            self.mark_failed(index, &failure);
            excluded.push(index);
            last_error = Some(format!("{}: {failure}", server.name));
        }

        let detail = last_error.unwrap_or_else(|| {
            if read_only {
                "no active server with spare capacity".to_string()
            } else {
                "no active primary with spare capacity".to_string()
            }
        });
        error!(read_only, "no database server available: {detail}");
        Err(PoolError::NoServerAvailable(detail))
    }

    fn mark_failed(&self, index: usize, error: &ConnectError) {
        let mut state = self.shared.lock();
        let server = &mut state.servers[index];
        if server.mark_failed(error.to_string()) {
            warn!(
                server = %server.config.name,
                role = %server.config.role,
                failures = server.failure_count,
                "server marked failed: {error}"
            );
        }
    }

    /// Probe every server, update statuses and evict stale idle entries.
    pub async fn health_check(&self) -> HealthReport {
        let probe_timeout = self.config.health_check_timeout();
        let mut results = Vec::with_capacity(self.config.servers.len());
        for server in &self.config.servers {
            let result = match timeout(probe_timeout, self.connector.probe(server)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout(probe_timeout)),
            };
            results.push(result);
        }

        let now = self.shared.clock.now();
        let idle_limit = self.idle_limit;
        let (report, evicted) = {
            let mut state = self.shared.lock();
            for (server, result) in state.servers.iter_mut().zip(&results) {
                match result {
                    Ok(()) => {
                        if server.mark_healthy(now) {
                            info!(server = %server.config.name, "server recovered");
                        }
                    }
                    Err(e) => {
                        server.last_health_check = Some(now);
                        if server.mark_failed(e.to_string()) {
                            warn!(
                                server = %server.config.name,
                                "server failed health check: {e}"
                            );
                        }
                    }
                }
            }
            let evicted = state.evict_where(|e, server| {
                e.is_idle() && (!server.is_active() || now - e.last_used_at > idle_limit)
            });
            let stats = state.stats(self.config.max_pool_size);
            let report = HealthReport {
                healthy_servers: state.servers.iter().filter(|s| s.is_active()).count(),
                total_servers: state.servers.len(),
                pool_size: stats.size,
                active: stats.active,
                idle: stats.idle,
                evicted: evicted.len(),
            };
            (report, evicted)
        };
        close_all(evicted).await;
        debug!(?report, "health check complete");
        report
    }

    /// Open connections until the pool holds `min_pool_size`. Returns how
    /// many were opened.
    pub async fn warm_up(&self) -> usize {
        let has_replicas = self
            .config
            .servers
            .iter()
            .any(|s| s.role == ServerRole::Replica);
        let mut handles = Vec::new();
        while self.shared.lock().size() < self.config.min_pool_size {
            let read_only = has_replicas && handles.len() % 2 == 1;
            match self.open_new(read_only).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!("pool warm-up stopped early: {e}");
                    break;
                }
            }
        }
        let opened = handles.len();
        drop(handles);
        info!(opened, "connection pool warmed up");
        opened
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.lock().stats(self.config.max_pool_size)
    }

    pub fn servers(&self) -> Vec<ServerSnapshot> {
        self.shared
            .lock()
            .servers
            .iter()
            .map(ServerState::snapshot)
            .collect()
    }

    /// Refuse new acquisitions and close idle connections. Checked-out
    /// connections are closed when their handles are returned.
    pub async fn shutdown(&self) -> usize {
        let idle = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.evict_where(|e, _| e.is_idle())
        };
        let closed = idle.len();
        close_all(idle).await;
        info!(closed, "connection pool shut down");
        closed
    }
}

async fn close_all<T: DbConnection>(conns: Vec<T>) {
    for conn in conns {
        if let Err(e) = conn.close().await {
            debug!("connection close failed: {e}");
        }
    }
}
